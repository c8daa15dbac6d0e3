//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use taskctx::config::{ContextConfiguration, RuntimeConfig};
use taskctx::test_utils::{FixedMapper, Harness, MemoryForest, RecordingOwner, harness};
use taskctx::{InnerContext, OwnerTask, TaskRegions};

pub use taskctx::test_utils::init_test_logging;

/// Initializes logging and announces the test.
pub fn init_test(name: &str) {
    init_test_logging();
    taskctx::test_phase!(name);
}

/// A task context on a single-process runtime.
pub struct TaskFixture {
    pub forest: Arc<MemoryForest>,
    pub harness: Harness,
    pub owner: Arc<RecordingOwner>,
    pub ctx: Arc<InnerContext>,
}

/// Builds a task context and lets a mapper apply `configure` to it.
pub fn task_context(
    name: &str,
    configure: impl Fn(&mut ContextConfiguration) + Send + Sync + 'static,
) -> TaskFixture {
    let forest = Arc::new(MemoryForest::new());
    let harness = harness(RuntimeConfig::default(), Arc::clone(&forest));
    let owner = RecordingOwner::new(&harness.runtime, name);
    let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
    let ctx = InnerContext::new(&harness.runtime, &dyn_owner, TaskRegions::default());
    ctx.configure_context(&FixedMapper::new("fixed", configure))
        .expect("mapper output is valid");
    TaskFixture {
        forest,
        harness,
        owner,
        ctx,
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
