//! Fences and traces.
//!
//! A fence is a total-order point: every child registered after it depends
//! on it until the fence commits. A trace records the dependence decisions
//! of a code region the first time it runs and replays them afterwards.

use super::inner::InnerContext;
use crate::error::{ContextError, ErrorKind};
use crate::operation::{Fence, Operation};
use crate::tracing_compat::{debug, error, trace};
use crate::types::TraceId;
use std::sync::Arc;

/// A trace known to a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace {
    id: TraceId,
    fixed: bool,
}

impl Trace {
    const fn new(id: TraceId) -> Self {
        Self { id, fixed: false }
    }

    /// Trace id.
    #[must_use]
    pub const fn id(&self) -> TraceId {
        self.id
    }

    /// True once capture finished and the trace replays.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.fixed
    }
}

impl InnerContext {
    /// Makes `fence` the current fence, releasing the previous one.
    pub fn update_current_fence(&self, fence: Arc<dyn Fence>) {
        let generation = fence.generation();
        fence.add_mapping_reference(generation);
        let previous = self
            .lock()
            .ext
            .current_fence
            .replace((Arc::clone(&fence), generation));
        if let Some((old, old_generation)) = previous {
            old.remove_mapping_reference(old_generation);
        }
        trace!(ctx = %self.uid(), fence = %fence.unique_id(), generation, "fence updated");
    }

    /// Makes `op` depend on the current fence.
    ///
    /// If the fence has already committed the context drops it so later
    /// children skip the check.
    pub fn register_fence_dependence(&self, op: &dyn Operation) {
        let Some((fence, generation)) = self.lock().ext.current_fence.clone() else {
            return;
        };
        if !op.register_dependence(&*fence, generation) {
            return;
        }
        let mut state = self.lock();
        if state
            .ext
            .current_fence
            .as_ref()
            .is_some_and(|(current, g)| Arc::ptr_eq(current, &fence) && *g == generation)
        {
            state.ext.current_fence = None;
            trace!(ctx = %self.uid(), fence = %fence.unique_id(), "committed fence pruned");
        }
    }

    /// Generation of the current fence, if one is set.
    #[must_use]
    pub fn current_fence_generation(&self) -> Option<u64> {
        self.lock().ext.current_fence.as_ref().map(|(_, generation)| *generation)
    }

    /// Opens trace `tid`.
    ///
    /// A new id starts capturing. A known id is replayed behind a mapping
    /// fence. Traces do not nest.
    pub fn begin_trace(&self, tid: TraceId) -> Result<(), ContextError> {
        let replay = {
            let mut state = self.lock();
            if let Some(open) = state.ext.current_trace {
                let err = ContextError::new(
                    ErrorKind::IllegalNestedTrace,
                    format!(
                        "illegal nested trace with ID {tid} attempted in task {} while trace {open} is open",
                        self.info()
                    ),
                );
                error!(ctx = %self.uid(), trace = %tid, "{err}");
                return Err(err);
            }
            let replay = state.ext.traces.contains_key(&tid);
            if !replay {
                state.ext.traces.insert(tid, Trace::new(tid));
                state.ext.current_trace = Some(tid);
            }
            replay
        };
        if replay {
            let this = self.arc()?;
            self.runtime().issuer().issue_mapping_fence(&this);
            self.lock().ext.current_trace = Some(tid);
        }
        debug!(ctx = %self.uid(), trace = %tid, replay, "trace begun");
        Ok(())
    }

    /// Closes trace `tid`.
    ///
    /// A capturing trace becomes fixed and the capture is issued; a fixed
    /// trace issues its completion.
    pub fn end_trace(&self, tid: TraceId) -> Result<(), ContextError> {
        let was_fixed = {
            let mut state = self.lock();
            if state.ext.current_trace != Some(tid) {
                let err = ContextError::new(
                    ErrorKind::UnmatchedEndTrace,
                    format!("unmatched end trace for ID {tid} in task {}", self.info()),
                );
                error!(ctx = %self.uid(), trace = %tid, "{err}");
                return Err(err);
            }
            state.ext.current_trace = None;
            let trace = state.ext.traces.entry(tid).or_insert_with(|| Trace::new(tid));
            std::mem::replace(&mut trace.fixed, true)
        };
        let this = self.arc()?;
        let issuer = self.runtime().issuer();
        if was_fixed {
            issuer.issue_trace_complete(&this, tid);
        } else {
            issuer.issue_trace_capture(&this, tid);
        }
        debug!(ctx = %self.uid(), trace = %tid, captured = !was_fixed, "trace ended");
        Ok(())
    }

    /// The open trace, if any.
    #[must_use]
    pub fn current_trace(&self) -> Option<Trace> {
        let state = self.lock();
        state
            .ext
            .current_trace
            .and_then(|tid| state.ext.traces.get(&tid).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::core::TaskRegions;
    use crate::operation::OwnerTask;
    use crate::test_utils::{Harness, MemoryForest, RecordingOwner, TestFence, TestOp, harness};

    fn context() -> (Harness, Arc<RecordingOwner>, Arc<InnerContext>) {
        let h = harness(RuntimeConfig::default(), Arc::new(MemoryForest::new()));
        let owner = RecordingOwner::new(&h.runtime, "tracer");
        let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
        let ctx = InnerContext::new(&h.runtime, &dyn_owner, TaskRegions::default());
        (h, owner, ctx)
    }

    #[test]
    fn first_trace_captures_then_replays() {
        let (h, _owner, ctx) = context();
        let tid = TraceId(5);
        ctx.begin_trace(tid).expect("begin");
        let op = TestOp::new(h.runtime.next_unique_id());
        let dyn_op: Arc<dyn Operation> = op.clone();
        ctx.register_new_child_operation(&dyn_op);
        assert_eq!(op.trace(), Some((tid, true)));
        ctx.end_trace(tid).expect("end");
        assert_eq!(h.issuer.captures(), vec![(ctx.uid(), tid)]);
        assert!(h.issuer.mapping_fences().is_empty());

        ctx.begin_trace(tid).expect("replay");
        assert_eq!(h.issuer.mapping_fences(), vec![ctx.uid()]);
        let replayed = TestOp::new(h.runtime.next_unique_id());
        let dyn_replayed: Arc<dyn Operation> = replayed.clone();
        ctx.register_new_child_operation(&dyn_replayed);
        assert_eq!(replayed.trace(), Some((tid, false)));
        assert!(ctx.current_trace().is_some_and(|t| t.is_fixed()));
        ctx.end_trace(tid).expect("end replay");
        assert_eq!(h.issuer.completes(), vec![(ctx.uid(), tid)]);
        assert!(ctx.current_trace().is_none());
    }

    #[test]
    fn nested_and_unmatched_traces_fail() {
        let (_h, _owner, ctx) = context();
        let err = ctx.end_trace(TraceId(1)).expect_err("nothing open");
        assert_eq!(err.kind(), ErrorKind::UnmatchedEndTrace);
        ctx.begin_trace(TraceId(1)).expect("begin");
        let err = ctx.begin_trace(TraceId(2)).expect_err("nested");
        assert_eq!(err.kind(), ErrorKind::IllegalNestedTrace);
        let err = ctx.end_trace(TraceId(2)).expect_err("wrong id");
        assert_eq!(err.kind(), ErrorKind::UnmatchedEndTrace);
    }

    #[test]
    fn open_trace_blocks_task_end() {
        let (_h, _owner, ctx) = context();
        ctx.begin_trace(TraceId(3)).expect("begin");
        let err = ctx.end_task(Vec::new()).expect_err("trace open");
        assert_eq!(err.kind(), ErrorKind::IncompleteTrace);
        assert!(!ctx.task_executed());
    }

    #[test]
    fn replacing_a_fence_moves_the_mapping_reference() {
        let (h, _owner, ctx) = context();
        let first = TestFence::new(h.runtime.next_unique_id());
        let second = TestFence::new(h.runtime.next_unique_id());
        ctx.update_current_fence(first.clone());
        assert_eq!(first.mapping_references(), 1);
        ctx.update_current_fence(second.clone());
        assert_eq!(first.mapping_references(), 0);
        assert_eq!(second.mapping_references(), 1);
        assert_eq!(ctx.current_fence_generation(), Some(second.generation()));
    }

    #[test]
    fn committed_fence_is_pruned() {
        let (h, _owner, ctx) = context();
        let fence = TestFence::new(h.runtime.next_unique_id());
        ctx.update_current_fence(fence.clone());

        let early = TestOp::new(h.runtime.next_unique_id());
        ctx.register_fence_dependence(&*early);
        assert_eq!(early.fence_dependences(), vec![(fence.unique_id(), fence.generation())]);
        assert!(ctx.current_fence_generation().is_some());

        fence.commit();
        let late = TestOp::new(h.runtime.next_unique_id());
        ctx.register_fence_dependence(&*late);
        assert!(ctx.current_fence_generation().is_none());

        let after = TestOp::new(h.runtime.next_unique_id());
        ctx.register_fence_dependence(&*after);
        assert!(after.fence_dependences().is_empty());
    }
}
