//! Scheduling gates under concurrency, against the worker pool and the
//! recording scheduler.

mod common;

use common::{init_test, wait_until};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use taskctx::config::RuntimeConfig;
use taskctx::runtime::WorkerPool;
use taskctx::runtime::scheduler::Activation;
use taskctx::test_utils::{FixedMapper, MemoryForest, RecordingIssuer, RecordingOwner, harness};
use taskctx::{
    ContextRuntime, InnerContext, MetaScheduler, OpIssuer, OwnerTask, TaskRegions, test_complete, test_section,
};

const THREADS: usize = 4;
const ROUNDS: usize = 200;

fn pooled_context(min_frames: usize) -> (Arc<WorkerPool>, Arc<RecordingOwner>, Arc<InnerContext>) {
    let pool = Arc::new(WorkerPool::new(2));
    let scheduler: Arc<dyn MetaScheduler> = pool.clone();
    let issuer: Arc<dyn OpIssuer> = Arc::new(RecordingIssuer::new());
    let runtime = ContextRuntime::new(
        RuntimeConfig::default(),
        Arc::new(MemoryForest::new()),
        scheduler,
        issuer,
    )
    .expect("default configuration");
    let owner = RecordingOwner::new(&runtime, "gated");
    let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
    let ctx = InnerContext::new(&runtime, &dyn_owner, TaskRegions::default());
    if min_frames > 0 {
        ctx.configure_context(&FixedMapper::new("frames", move |config| {
            config.min_frames_to_schedule = min_frames;
        }))
        .expect("frame configuration");
    }
    (pool, owner, ctx)
}

fn churn(ctx: &Arc<InnerContext>) {
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = Arc::clone(ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::new();
                barrier.wait();
                for _ in 0..ROUNDS {
                    ctx.increment_outstanding();
                    if rng.bool() {
                        thread::yield_now();
                    }
                    ctx.decrement_outstanding();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("churn thread");
    }
}

#[test]
fn concurrent_churn_ends_inactive_in_the_pool() {
    init_test("concurrent_churn_ends_inactive_in_the_pool");
    let (pool, _owner, ctx) = pooled_context(0);

    test_section!("churn");
    churn(&ctx);

    test_section!("settle");
    assert!(!ctx.is_active());
    assert!(wait_until(Duration::from_secs(5), || !pool
        .active_contexts()
        .contains(&ctx.uid())));
    test_complete!("concurrent_churn_ends_inactive_in_the_pool", rounds = THREADS * ROUNDS);
}

#[test]
fn activation_edges_alternate() {
    init_test("activation_edges_alternate");
    let h = harness(RuntimeConfig::default(), Arc::new(MemoryForest::new()));
    let owner = RecordingOwner::new(&h.runtime, "gated");
    let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
    let ctx = InnerContext::new(&h.runtime, &dyn_owner, TaskRegions::default());

    churn(&ctx);

    let edges: Vec<_> = h
        .scheduler
        .activations()
        .into_iter()
        .filter(|edge| matches!(edge, Activation::Activated(uid) | Activation::Deactivated(uid) if *uid == ctx.uid()))
        .collect();
    assert!(!edges.is_empty());
    for (idx, edge) in edges.iter().enumerate() {
        let expected = if idx % 2 == 0 {
            Activation::Activated(ctx.uid())
        } else {
            Activation::Deactivated(ctx.uid())
        };
        assert_eq!(*edge, expected, "edge {idx} out of order");
    }
    assert!(matches!(edges.last(), Some(Activation::Deactivated(_))));
    test_complete!("activation_edges_alternate", edges = edges.len());
}

#[test]
fn pending_subtasks_gate_by_task_count() {
    init_test("pending_subtasks_gate_by_task_count");
    let (pool, _owner, ctx) = pooled_context(0);
    let uid = ctx.uid();

    ctx.increment_outstanding();
    assert!(pool.active_contexts().contains(&uid));

    ctx.increment_pending();
    assert!(!ctx.is_active());
    assert!(!pool.active_contexts().contains(&uid));

    ctx.decrement_pending().wait();
    assert!(ctx.is_active());
    assert!(pool.active_contexts().contains(&uid));

    ctx.decrement_outstanding();
    assert!(!pool.active_contexts().contains(&uid));
    test_complete!("pending_subtasks_gate_by_task_count");
}

#[test]
fn pending_frames_gate_by_frame_count() {
    init_test("pending_frames_gate_by_frame_count");
    let (pool, _owner, ctx) = pooled_context(2);
    let uid = ctx.uid();

    ctx.increment_outstanding();
    assert!(pool.active_contexts().contains(&uid));

    test_section!("task count is ignored");
    ctx.increment_pending();
    assert!(ctx.is_active());
    assert!(ctx.decrement_pending().is_none());

    test_section!("frames fill the minimum");
    ctx.increment_frame();
    assert!(ctx.is_active());
    ctx.increment_frame();
    assert!(!pool.active_contexts().contains(&uid));

    ctx.decrement_frame();
    assert!(pool.active_contexts().contains(&uid));
    ctx.decrement_frame();
    ctx.decrement_outstanding();
    assert!(!pool.active_contexts().contains(&uid));
    test_complete!("pending_frames_gate_by_frame_count");
}
