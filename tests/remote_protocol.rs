//! Two runtimes on a loopback network: mirrors, version ownership and
//! remote view construction.

mod common;

use common::init_test;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use taskctx::config::RuntimeConfig;
use taskctx::runtime::WorkerPool;
use taskctx::sync::UserEvent;
use taskctx::test_utils::{Harness, LoopbackNetwork, MemoryForest, RecordingIssuer, RecordingOwner, harness};
use taskctx::types::{ManagerId, RegionTreeNode};
use taskctx::{
    AddressSpace, ContextKind, ContextRuntime, ErrorKind, FieldSpace, InnerContext, MetaScheduler, OpIssuer,
    OwnerTask, TaskContext, TaskRegions, test_complete, test_section,
};

/// Two processes sharing one region forest.
struct Cluster {
    forest: Arc<MemoryForest>,
    network: Arc<LoopbackNetwork>,
    zero: Harness,
    one: Harness,
}

fn cluster() -> Cluster {
    let forest = Arc::new(MemoryForest::new());
    let network = LoopbackNetwork::new();
    let zero = harness(RuntimeConfig::for_space(0, 2), Arc::clone(&forest));
    let one = harness(RuntimeConfig::for_space(1, 2), Arc::clone(&forest));
    network.join(&zero.runtime);
    network.join(&one.runtime);
    Cluster {
        forest,
        network,
        zero,
        one,
    }
}

fn task_on_zero(c: &Cluster, name: &str) -> (Arc<RecordingOwner>, Arc<InnerContext>) {
    let owner = RecordingOwner::new(&c.zero.runtime, name);
    let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
    let ctx = InnerContext::new(&c.zero.runtime, &dyn_owner, TaskRegions::default());
    (owner, ctx)
}

#[test]
fn top_level_asks_the_node_owner_once() {
    init_test("top_level_asks_the_node_owner_once");
    let c = cluster();
    let region = c.forest.new_tree(1);
    let node = RegionTreeNode::Region(region);
    c.forest.set_node_owner(node, AddressSpace::new(1));
    let top = InnerContext::new_top_level(&c.zero.runtime);

    test_section!("first request travels");
    assert_eq!(top.get_version_owner(node, AddressSpace::new(0)), Ok(AddressSpace::new(0)));
    let delivered = c.network.delivered();
    assert!(delivered > 0);
    let mirror = c.one.runtime.lookup_context(top.uid()).expect("top-level mirror");
    assert_eq!(mirror.context_kind(), ContextKind::Remote);
    assert_eq!(mirror.known_version_owner(node), Some(AddressSpace::new(0)));

    test_section!("second request is cached");
    assert_eq!(top.get_version_owner(node, AddressSpace::new(0)), Ok(AddressSpace::new(0)));
    assert_eq!(c.network.delivered(), delivered);
    test_complete!("top_level_asks_the_node_owner_once", messages = delivered);
}

#[test]
fn mirror_defers_version_ownership_to_the_original() {
    init_test("mirror_defers_version_ownership_to_the_original");
    let c = cluster();
    let region = c.forest.new_tree(1);
    let node = RegionTreeNode::Region(region);
    let (owner, ctx) = task_on_zero(&c, "stencil");

    test_section!("fetch mirror");
    let mirror = c.one.runtime.find_context(ctx.uid()).expect("mirror fetched");
    assert_eq!(mirror.context_kind(), ContextKind::Remote);
    assert_eq!(mirror.task_info().name, "stencil");
    assert_eq!(ctx.remote_instances(), vec![AddressSpace::new(1)]);

    test_section!("resolve owner");
    assert_eq!(mirror.get_version_owner(node, AddressSpace::new(1)), Ok(AddressSpace::new(1)));
    assert_eq!(ctx.known_version_owner(node), Some(AddressSpace::new(1)));
    assert_eq!(ctx.get_version_owner(node, AddressSpace::new(0)), Ok(AddressSpace::new(1)));

    test_section!("parent chain");
    let parent = mirror.find_parent_context().expect("parent mirror");
    assert_eq!(parent.context_uid(), owner.parent().uid());
    assert_eq!(parent.kind(), ContextKind::Remote);
    let top = mirror.find_top_context().expect("top context");
    assert_eq!(top.uid(), owner.parent().uid());
    test_complete!("mirror_defers_version_ownership_to_the_original");
}

#[test]
fn remote_view_is_built_once_by_the_manager_owner() {
    init_test("remote_view_is_built_once_by_the_manager_owner");
    let c = cluster();
    let manager = ManagerId(5);
    let (_owner, ctx) = task_on_zero(&c, "viewer");
    let mirror = c.one.runtime.find_context(ctx.uid()).expect("mirror fetched");

    let view = mirror
        .create_instance_top_view(manager, AddressSpace::new(1))
        .expect("remote view");
    assert_eq!(c.forest.views_built(manager), 1);
    assert_eq!(ctx.cached_top_view(manager), Some(view));

    let delivered = c.network.delivered();
    assert_eq!(mirror.create_instance_top_view(manager, AddressSpace::new(1)), Ok(view));
    assert_eq!(c.network.delivered(), delivered);
    assert_eq!(c.forest.views_built(manager), 1);
    test_complete!("remote_view_is_built_once_by_the_manager_owner");
}

#[test]
fn mirror_carries_local_fields() {
    init_test("mirror_carries_local_fields");
    let c = cluster();
    let (_owner, ctx) = task_on_zero(&c, "fields");
    let reclaim = UserEvent::new();
    let field = ctx.add_local_field(FieldSpace::new(4), 9, 8, 0, reclaim.event());

    let mirror = c.one.runtime.find_context(ctx.uid()).expect("mirror fetched");
    assert_eq!(mirror.local_fields(), vec![field]);
    test_complete!("mirror_carries_local_fields");
}

#[test]
fn dropping_the_original_frees_its_mirror() {
    init_test("dropping_the_original_frees_its_mirror");
    let c = cluster();
    let (_owner, ctx) = task_on_zero(&c, "short_lived");
    let uid = ctx.uid();
    let mirror = c.one.runtime.find_context(uid).expect("mirror fetched");
    drop(mirror);
    assert!(c.one.runtime.lookup_context(uid).is_some());

    drop(ctx);
    assert!(c.zero.runtime.lookup_context(uid).is_none());
    assert!(c.one.runtime.lookup_context(uid).is_none());
    test_complete!("dropping_the_original_frees_its_mirror");
}

#[test]
fn contexts_missing_on_their_owner_are_errors() {
    init_test("contexts_missing_on_their_owner_are_errors");
    let c = cluster();
    let stale = c.zero.runtime.next_unique_id();
    let err = c.zero.runtime.find_context(stale).expect_err("never registered");
    assert_eq!(err.kind(), ErrorKind::MissingContext);
    test_complete!("contexts_missing_on_their_owner_are_errors");
}

fn pooled_runtime(space: u32, forest: &Arc<MemoryForest>) -> Arc<ContextRuntime> {
    let scheduler: Arc<dyn MetaScheduler> = Arc::new(WorkerPool::new(1));
    let issuer: Arc<dyn OpIssuer> = Arc::new(RecordingIssuer::new());
    ContextRuntime::new(RuntimeConfig::for_space(space, 2), Arc::<MemoryForest>::clone(forest), scheduler, issuer)
        .expect("valid configuration")
}

#[test]
fn blocked_handlers_still_receive_their_responses() {
    const REQUESTS: usize = 4;
    init_test("blocked_handlers_still_receive_their_responses");
    let forest = Arc::new(MemoryForest::new());
    let network = LoopbackNetwork::new();
    let zero = pooled_runtime(0, &forest);
    let one = pooled_runtime(1, &forest);
    network.join(&zero);
    network.join(&one);

    test_section!("more version owner requests than workers");
    let (tx, rx) = mpsc::channel();
    let mut tops = Vec::new();
    for _ in 0..REQUESTS {
        let region = forest.new_tree(1);
        let node = RegionTreeNode::Region(region);
        forest.set_node_owner(node, AddressSpace::new(1));
        let top = InnerContext::new_top_level(&zero);
        tops.push(Arc::clone(&top));
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = tx.send(top.get_version_owner(node, AddressSpace::new(0)));
        });
    }

    test_section!("every request answers");
    for _ in 0..REQUESTS {
        let answer = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("version owner request stalled behind a blocked handler");
        assert_eq!(answer, Ok(AddressSpace::new(0)));
    }
    for top in &tops {
        assert!(one.lookup_context(top.uid()).is_some(), "mirror installed");
    }
    test_complete!("blocked_handlers_still_receive_their_responses", requests = REQUESTS);
}
