//! Contexts of leaf tasks.
//!
//! A leaf task promises not to launch anything, so its context carries no
//! child tracking, no region-tree context and no scheduling gate. What it
//! still does: privilege checks for the regions it was given, name
//! bookkeeping, local fields and the end-of-task protocol.

use super::core::{ContextCore, ExecutionSummary, TaskRegions};
use super::{ContextKind, InnerContext, TaskContext};
use crate::error::{ContextError, ErrorKind};
use crate::operation::{CloseKind, InlineTask, Operation, OwnerTask, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::ContextRuntime;
use crate::sync::Event;
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::{AddressSpace, RegionRequirement, RegionTreeNode, UniqueId};
use crate::wire::{LocalFieldInfo, RemoteContextPayload};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Context of a task that launches no children.
pub struct LeafContext {
    core: ContextCore<()>,
}

impl fmt::Debug for LeafContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafContext")
            .field("uid", &self.uid())
            .field("task", &self.info().name)
            .finish_non_exhaustive()
    }
}

impl Deref for LeafContext {
    type Target = ContextCore<()>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl LeafContext {
    /// Creates the context of leaf task `owner`.
    pub fn new(runtime: &Arc<ContextRuntime>, owner: &Arc<dyn OwnerTask>, setup: TaskRegions) -> Arc<Self> {
        let core = ContextCore::new(Arc::clone(runtime), owner.info(), Some(owner), setup, ());
        let ctx = Arc::new(Self { core });
        trace!(ctx = %ctx.uid(), task = %ctx.info().name, "leaf context created");
        ctx
    }

    fn refuse(&self, kind: ErrorKind, what: &str) -> ContextError {
        let err = ContextError::new(kind, format!("leaf task {} attempted to {what}", self.info()));
        error!(ctx = %self.uid(), "{err}");
        err
    }

    fn parent(&self) -> Option<Arc<dyn TaskContext>> {
        self.owner().and_then(|owner| owner.parent_context())
    }

    /// Issues virtual closes for written, virtually mapped regions.
    ///
    /// The close runs in the context that holds the region's physical
    /// state, against the parent's requirement index.
    fn close_virtual_regions(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        for (idx, req) in self.regions.iter().enumerate() {
            if !req.privilege.is_write() || !self.virtual_mapped[idx] {
                continue;
            }
            let parent_index = self.parent_req_indexes[idx];
            if let Some(target) = parent.find_parent_physical_context(parent_index) {
                trace!(ctx = %self.uid(), index = idx, target = %target.uid(), "issuing virtual close");
                self.runtime()
                    .issuer()
                    .issue_close(&target, parent_index, CloseKind::Virtual);
            }
        }
    }
}

impl TaskContext for LeafContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Leaf
    }

    fn context_uid(&self) -> UniqueId {
        self.uid()
    }

    fn task_info(&self) -> &TaskInfo {
        self.info()
    }

    fn runtime(&self) -> &Arc<ContextRuntime> {
        self.core.runtime()
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        self.parent()
    }

    fn find_outermost_local_context(&self, previous: Option<Arc<InnerContext>>) -> Option<Arc<InnerContext>> {
        match self.parent() {
            Some(parent) => parent.find_outermost_local_context(previous),
            None => previous,
        }
    }

    fn find_top_context(&self) -> Option<Arc<InnerContext>> {
        self.parent().and_then(|parent| parent.find_top_context())
    }

    fn find_parent_logical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        let parent_index = *self.parent_req_indexes.get(index)?;
        self.parent()?.find_parent_logical_context(parent_index)
    }

    fn find_parent_physical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        let parent_index = *self.parent_req_indexes.get(index)?;
        self.parent()?.find_parent_physical_context(parent_index)
    }

    fn get_version_owner(&self, node: RegionTreeNode, _source: AddressSpace) -> Result<AddressSpace, ContextError> {
        Ok(self.forest().node_owner(node))
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        if let Some(parent) = self.parent() {
            parent.find_enclosing_local_fields(out);
        }
        out.extend(self.local_fields());
    }

    fn pack_remote_context(&self, target: AddressSpace) -> Result<RemoteContextPayload, ContextError> {
        Err(self.refuse(ErrorKind::LeafPack, &format!("send its context to {target}")))
    }

    fn register_new_child_operation(&self, op: &Arc<dyn Operation>) -> Result<usize, ContextError> {
        Err(self.refuse(
            ErrorKind::LeafChildLaunch,
            &format!("launch child operation {}", op.unique_id()),
        ))
    }

    fn add_to_dependence_queue(&self, op: Arc<dyn Operation>, _precondition: Event) -> Result<Event, ContextError> {
        Err(self.refuse(
            ErrorKind::LeafChildLaunch,
            &format!("analyze child operation {}", op.unique_id()),
        ))
    }

    fn register_child_executed(&self, op: UniqueId) {
        warn!(ctx = %self.uid(), op = %op, "leaf context has no children");
    }

    fn register_child_complete(&self, op: UniqueId) {
        warn!(ctx = %self.uid(), op = %op, "leaf context has no children");
    }

    fn register_child_commit(&self, op: UniqueId) {
        warn!(ctx = %self.uid(), op = %op, "leaf context has no children");
    }

    fn unregister_child_operation(&self, _op: UniqueId) {}

    fn register_fence_dependence(&self, _op: &dyn Operation) {}

    fn increment_pending(&self) {}

    fn decrement_pending(&self) -> Event {
        Event::NONE
    }

    fn find_parent_region(&self, req: &RegionRequirement) -> Result<usize, ContextError> {
        self.core.find_parent_region(req)
    }

    fn num_regions(&self) -> usize {
        self.regions.len()
    }

    fn clone_requirement(&self, index: usize) -> Option<RegionRequirement> {
        self.core.clone_requirement(index)
    }

    fn get_physical_region(&self, index: usize) -> Option<PhysicalRegion> {
        self.core.get_physical_region(index)
    }

    fn physical_regions(&self) -> Vec<PhysicalRegion> {
        self.core.physical_regions()
    }

    fn begin_task(&self) -> Vec<PhysicalRegion> {
        self.start_task()
    }

    /// Leaf tasks issue closes only for regions they mapped virtually, and
    /// only if they own virtual instances at all.
    fn end_task(&self, result: Vec<u8>) -> Result<(), ContextError> {
        self.unmap_inline_regions();
        if self.owner().is_some_and(|owner| owner.has_virtual_instances()) {
            self.close_virtual_regions();
        }
        self.post_end_task(result);
        Ok(())
    }

    fn post_end_task(&self, result: Vec<u8>) {
        self.finish_task(result, ExecutionSummary::childless);
        debug!(ctx = %self.uid(), "leaf task finished");
    }

    fn attempt_children_complete(&self) -> bool {
        let fire = self.claim_children_complete();
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_complete();
        }
        fire
    }

    fn attempt_children_commit(&self) -> bool {
        let fire = self.claim_children_commit();
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_committed();
        }
        fire
    }

    fn inline_child_task(&self, child: &Arc<dyn InlineTask>) -> Result<(), ContextError> {
        Err(self.refuse(
            ErrorKind::LeafInlineChild,
            &format!("inline child task {}", child.info()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::test_utils::{Harness, MemoryForest, RecordingOwner, TestOp, harness};
    use crate::types::{Coherence, PrivilegeMode};

    struct Fixture {
        forest: Arc<MemoryForest>,
        h: Harness,
        owner: Arc<RecordingOwner>,
    }

    fn fixture() -> Fixture {
        let forest = Arc::new(MemoryForest::new());
        let h = harness(RuntimeConfig::default(), Arc::clone(&forest));
        let owner = RecordingOwner::new(&h.runtime, "leaf");
        Fixture { forest, h, owner }
    }

    fn leaf(f: &Fixture, setup: TaskRegions) -> Arc<LeafContext> {
        let dyn_owner: Arc<dyn OwnerTask> = f.owner.clone();
        LeafContext::new(&f.h.runtime, &dyn_owner, setup)
    }

    #[test]
    fn leaf_refuses_children_and_packing() {
        let f = fixture();
        let ctx = leaf(&f, TaskRegions::default());
        let op: Arc<dyn Operation> = TestOp::new(f.h.runtime.next_unique_id());
        let err = ctx.register_new_child_operation(&op).expect_err("leaf");
        assert_eq!(err.kind(), ErrorKind::LeafChildLaunch);
        assert_eq!(err.exit_code(), 73);
        let err = ctx.add_to_dependence_queue(op, Event::NONE).expect_err("leaf");
        assert_eq!(err.kind(), ErrorKind::LeafChildLaunch);
        let err = ctx.pack_remote_context(AddressSpace::new(0)).expect_err("leaf");
        assert_eq!(err.kind(), ErrorKind::LeafPack);
        assert_eq!(ctx.kind(), ContextKind::Leaf);
    }

    #[test]
    fn leaf_end_fires_both_callbacks_once() {
        let f = fixture();
        let ctx = leaf(&f, TaskRegions::default());
        assert!(ctx.begin_task().is_empty());
        ctx.end_task(b"leaf".to_vec()).expect("end");
        assert_eq!(f.owner.children_complete_calls(), 1);
        assert_eq!(f.owner.children_committed_calls(), 1);
        assert_eq!(f.owner.futures(), vec![b"leaf".to_vec()]);
        assert!(!ctx.attempt_children_complete());
        assert!(!ctx.attempt_children_commit());
        assert_eq!(f.owner.children_complete_calls(), 1);
        assert!(f.h.issuer.closes().is_empty());
    }

    #[test]
    fn virtual_instances_close_in_the_parent() {
        let f = fixture();
        let region = f.forest.new_tree(1);
        let rw = RegionRequirement::region(region, PrivilegeMode::READ_WRITE, Coherence::Exclusive, region)
            .with_fields([1]);
        f.owner.set_virtual_instances(true);
        let setup = TaskRegions::new(vec![rw.clone(), rw]).with_virtual_mapped(vec![true, false]);
        let ctx = leaf(&f, setup);
        ctx.end_task(Vec::new()).expect("end");
        let top = f.owner.parent().uid();
        assert_eq!(f.h.issuer.closes(), vec![(top, 0, CloseKind::Virtual)]);
    }

    #[test]
    fn leaf_version_owner_is_the_node_owner() {
        let f = fixture();
        let region = f.forest.new_tree(1);
        let node = RegionTreeNode::Region(region);
        f.forest.set_node_owner(node, AddressSpace::new(3));
        let ctx = leaf(&f, TaskRegions::default());
        assert_eq!(ctx.get_version_owner(node, AddressSpace::new(0)), Ok(AddressSpace::new(3)));
    }

    #[test]
    fn leaf_sees_enclosing_local_fields() {
        let f = fixture();
        let ctx = leaf(&f, TaskRegions::default());
        let reclaim = crate::sync::UserEvent::new();
        let parent_field = f
            .owner
            .parent()
            .add_local_field(crate::types::FieldSpace::new(2), 7, 4, 0, reclaim.event());
        let own = ctx.add_local_field(crate::types::FieldSpace::new(2), 8, 4, 0, reclaim.event());
        let mut fields = Vec::new();
        ctx.find_enclosing_local_fields(&mut fields);
        assert_eq!(fields, vec![parent_field, own]);
    }
}
