//! Scheduling gates and frame pipelining.
//!
//! A context is *active*, eligible for the meta scheduler, while it has
//! outstanding subtasks and fewer pending ones than the mapper's minimum
//! (counted in tasks or in frames, never both). Every activation edge is
//! chained behind the previous one through `order`, so the scheduler sees
//! activate and deactivate calls in the order the edges were decided even
//! though they are decided on arbitrary threads.
//!
//! Frames bound how far a task's iterations may run ahead: issuing a frame
//! waits for the frame `max_outstanding_frames` back to finish.

use super::core::ContextState;
use super::inner::{InnerContext, InnerState};
use crate::config::ContextConfiguration;
use crate::runtime::Priority;
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{debug, trace};
use std::sync::Arc;

/// Activation state of a context.
#[derive(Debug, Clone, Default)]
pub(crate) struct Gate {
    pub(crate) active: bool,
    pub(crate) outstanding_subtasks: usize,
    pub(crate) pending_subtasks: usize,
    pub(crate) pending_frames: usize,
    /// Triggers once the last decided edge reached the scheduler.
    pub(crate) order: Event,
}

impl Gate {
    const fn below_minimum(&self, config: &ContextConfiguration) -> bool {
        (config.min_tasks_to_schedule > 0 && self.pending_subtasks < config.min_tasks_to_schedule)
            || (config.min_frames_to_schedule > 0 && self.pending_frames < config.min_frames_to_schedule)
    }
}

/// An activation edge decided under the lock, delivered after it.
#[must_use]
struct Edge {
    after: Event,
    next: UserEvent,
    activate: bool,
}

fn edge(state: &mut ContextState<InnerState>, activate: bool) -> Edge {
    let next = UserEvent::new();
    let after = std::mem::replace(&mut state.ext.gate.order, next.event());
    state.ext.gate.active = activate;
    Edge {
        after,
        next,
        activate,
    }
}

impl InnerContext {
    fn deliver(&self, edge: Option<Edge>) {
        let Some(Edge {
            after,
            next,
            activate,
        }) = edge
        else {
            return;
        };
        let runtime = Arc::clone(self.runtime());
        let uid = self.uid();
        debug!(ctx = %uid, activate, "context activation edge");
        after.on_trigger(move || {
            if activate {
                runtime.scheduler().activate_context(uid);
            } else {
                runtime.scheduler().deactivate_context(uid);
            }
            next.trigger();
        });
    }

    /// True while the context is eligible for scheduling.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().ext.gate.active
    }

    /// A subtask was launched from this context.
    pub fn increment_outstanding(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            let gate = &state.ext.gate;
            let activate = !gate.active && gate.outstanding_subtasks == 0 && gate.below_minimum(&config);
            let edge = activate.then(|| edge(&mut state, true));
            state.ext.gate.outstanding_subtasks += 1;
            edge
        };
        self.deliver(edge);
    }

    /// A subtask launched from this context finished.
    pub fn decrement_outstanding(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            let gate = &mut state.ext.gate;
            debug_assert!(gate.outstanding_subtasks > 0, "outstanding subtask underflow");
            gate.outstanding_subtasks = gate.outstanding_subtasks.saturating_sub(1);
            let deactivate = gate.active && gate.outstanding_subtasks == 0 && gate.below_minimum(&config);
            deactivate.then(|| edge(&mut state, false))
        };
        self.deliver(edge);
    }

    /// A subtask was mapped and waits to run. Counted only when scheduling
    /// by task count.
    pub fn increment_pending(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            if config.min_tasks_to_schedule == 0 {
                return;
            }
            let gate = &mut state.ext.gate;
            gate.pending_subtasks += 1;
            let deactivate = gate.active
                && gate.outstanding_subtasks > 0
                && gate.pending_subtasks == config.min_tasks_to_schedule;
            deactivate.then(|| edge(&mut state, false))
        };
        self.deliver(edge);
    }

    /// A pending subtask started running.
    ///
    /// The decrement runs as a latency meta task; the returned event
    /// triggers once it did. Returns [`Event::NONE`] when scheduling by
    /// frames.
    pub fn decrement_pending(&self) -> Event {
        if self.lock().ext.config.min_tasks_to_schedule == 0 {
            return Event::NONE;
        }
        let Ok(this) = self.arc() else {
            return Event::NONE;
        };
        self.runtime().scheduler().issue(
            Priority::Latency,
            Event::NONE,
            Box::new(move || this.decrement_pending_now()),
        )
    }

    fn decrement_pending_now(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            let gate = &mut state.ext.gate;
            gate.pending_subtasks = gate.pending_subtasks.saturating_sub(1);
            let activate = !gate.active
                && gate.outstanding_subtasks > 0
                && gate.pending_subtasks < config.min_tasks_to_schedule;
            activate.then(|| edge(&mut state, true))
        };
        trace!(ctx = %self.uid(), "pending subtask started");
        self.deliver(edge);
    }

    /// A frame started. Counted only when scheduling by frames.
    pub fn increment_frame(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            if config.min_frames_to_schedule == 0 {
                return;
            }
            let gate = &mut state.ext.gate;
            gate.pending_frames += 1;
            let deactivate = gate.active
                && gate.outstanding_subtasks > 0
                && gate.pending_frames == config.min_frames_to_schedule;
            deactivate.then(|| edge(&mut state, false))
        };
        self.deliver(edge);
    }

    /// A frame finished mapping.
    pub fn decrement_frame(&self) {
        let edge = {
            let mut state = self.lock();
            let config = state.ext.config;
            if config.min_frames_to_schedule == 0 {
                return;
            }
            let gate = &mut state.ext.gate;
            debug_assert!(gate.pending_frames > 0, "pending frame underflow");
            gate.pending_frames = gate.pending_frames.saturating_sub(1);
            let activate = !gate.active
                && gate.outstanding_subtasks > 0
                && gate.pending_frames < config.min_frames_to_schedule;
            activate.then(|| edge(&mut state, true))
        };
        self.deliver(edge);
    }

    // ---- frames ----

    /// Issues a frame that finishes when `termination` triggers.
    ///
    /// Blocks while `max_outstanding_frames` earlier frames are still in
    /// flight. Returns the termination event of the previous frame, or
    /// [`Event::NONE`] for the first one or when frames are disabled.
    pub fn issue_frame(&self, termination: Event) -> Event {
        if self.lock().ext.config.max_outstanding_frames == 0 {
            return Event::NONE;
        }
        self.perform_frame_issue(termination)
    }

    fn perform_frame_issue(&self, termination: Event) -> Event {
        let (previous, wait_on) = {
            let mut state = self.lock();
            let max = state.ext.config.max_outstanding_frames;
            let frames = &mut state.ext.frame_events;
            let previous = frames.back().cloned().unwrap_or(Event::NONE);
            let wait_on = if frames.len() >= max {
                frames.get(frames.len() - max).cloned()
            } else {
                None
            };
            frames.push_back(termination);
            (previous, wait_on)
        };
        if let Some(wait_on) = wait_on
            && !wait_on.has_triggered()
        {
            debug!(ctx = %self.uid(), "frame pipeline full, waiting");
            wait_on.wait();
        }
        previous
    }

    /// The oldest outstanding frame finished.
    pub fn finish_frame(&self, termination: &Event) {
        let mut state = self.lock();
        if state.ext.config.max_outstanding_frames == 0 {
            return;
        }
        let front = state.ext.frame_events.pop_front();
        debug_assert!(front.as_ref() == Some(termination), "frames finished out of order");
        trace!(ctx = %self.uid(), remaining = state.ext.frame_events.len(), "frame finished");
    }

    /// Frames issued and not yet finished.
    #[must_use]
    pub fn outstanding_frames(&self) -> usize {
        self.lock().ext.frame_events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::core::TaskRegions;
    use crate::operation::OwnerTask;
    use crate::runtime::scheduler::Activation;
    use crate::test_utils::{FixedMapper, Harness, MemoryForest, RecordingOwner, harness};

    fn context(min_tasks: usize, min_frames: usize) -> (Harness, Arc<RecordingOwner>, Arc<InnerContext>) {
        let h = harness(RuntimeConfig::default(), Arc::new(MemoryForest::new()));
        let owner = RecordingOwner::new(&h.runtime, "gated");
        let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
        let ctx = InnerContext::new(&h.runtime, &dyn_owner, TaskRegions::default());
        let mapper = FixedMapper::new("gate", move |cfg| {
            cfg.min_tasks_to_schedule = min_tasks;
            cfg.min_frames_to_schedule = min_frames;
            cfg.max_outstanding_frames = 2;
        });
        ctx.configure_context(&mapper).expect("valid configuration");
        (h, owner, ctx)
    }

    #[test]
    fn task_gate_activates_and_deactivates_in_order() {
        let (h, _owner, ctx) = context(2, 0);
        let uid = ctx.uid();
        ctx.increment_outstanding();
        assert!(ctx.is_active());
        ctx.increment_pending();
        ctx.increment_pending();
        assert!(!ctx.is_active(), "pending reached the minimum");
        ctx.decrement_pending().wait();
        assert!(ctx.is_active());
        ctx.decrement_pending().wait();
        ctx.decrement_outstanding();
        assert!(!ctx.is_active());
        let edges: Vec<_> = h
            .scheduler
            .activations()
            .into_iter()
            .filter(|a| matches!(a, Activation::Activated(u) | Activation::Deactivated(u) if *u == uid))
            .collect();
        assert_eq!(
            edges,
            vec![
                Activation::Activated(uid),
                Activation::Deactivated(uid),
                Activation::Activated(uid),
                Activation::Deactivated(uid),
            ]
        );
    }

    #[test]
    fn frame_gate_ignores_task_counts() {
        let (_h, _owner, ctx) = context(3, 1);
        assert_eq!(ctx.configuration().min_tasks_to_schedule, 0);
        assert!(ctx.decrement_pending().is_none());
        ctx.increment_outstanding();
        assert!(ctx.is_active());
        ctx.increment_frame();
        assert!(!ctx.is_active());
        ctx.decrement_frame();
        assert!(ctx.is_active());
    }

    #[test]
    fn frames_report_their_predecessor() {
        let (_h, _owner, ctx) = context(1, 0);
        let f1 = UserEvent::new();
        let f2 = UserEvent::new();
        assert!(ctx.issue_frame(f1.event()).is_none());
        assert_eq!(ctx.issue_frame(f2.event()), f1.event());
        assert_eq!(ctx.outstanding_frames(), 2);
        f1.trigger();
        ctx.finish_frame(&f1.event());
        assert_eq!(ctx.outstanding_frames(), 1);
    }
}
