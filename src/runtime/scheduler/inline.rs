//! Scheduler that runs meta tasks on the triggering thread.
//!
//! Useful for deterministic tests: a task issued with an already-triggered
//! precondition has run by the time `issue` returns.

use crate::runtime::{MetaScheduler, MetaTask, Priority};
use crate::sync::{Event, UserEvent};
use crate::types::UniqueId;
use parking_lot::Mutex;

/// Activation edge recorded by [`InlineScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `activate_context` was called.
    Activated(UniqueId),
    /// `deactivate_context` was called.
    Deactivated(UniqueId),
}

/// Runs each meta task synchronously once its precondition triggers.
#[derive(Debug, Default)]
pub struct InlineScheduler {
    activations: Mutex<Vec<Activation>>,
    issued: Mutex<Vec<Priority>>,
}

impl InlineScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activation edges in call order.
    #[must_use]
    pub fn activations(&self) -> Vec<Activation> {
        self.activations.lock().clone()
    }

    /// Priorities of issued tasks in issue order.
    #[must_use]
    pub fn issued_priorities(&self) -> Vec<Priority> {
        self.issued.lock().clone()
    }
}

impl MetaScheduler for InlineScheduler {
    fn issue(&self, priority: Priority, precondition: Event, task: MetaTask) -> Event {
        self.issued.lock().push(priority);
        let done = UserEvent::new();
        let finished = done.event();
        precondition.on_trigger(move || {
            task();
            done.trigger();
        });
        finished
    }

    fn activate_context(&self, ctx: UniqueId) {
        self.activations.lock().push(Activation::Activated(ctx));
    }

    fn deactivate_context(&self, ctx: UniqueId) {
        self.activations.lock().push(Activation::Deactivated(ctx));
    }
}
