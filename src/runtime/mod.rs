//! Deferred meta-task scheduling.
//!
//! Contexts never run their asynchronous bookkeeping inline on the thread
//! that triggered it. Dependence analysis, deferred window waits, remote view
//! construction and inbound message handling are issued as *meta tasks*
//! through a [`MetaScheduler`]: a boxed closure, a [`Priority`] and a
//! precondition [`Event`]. The returned event triggers once the closure has
//! run.
//!
//! The scheduler is also told when a context becomes eligible or ineligible
//! for scheduling ([`MetaScheduler::activate_context`]).

pub mod scheduler;

use crate::sync::Event;
use crate::types::UniqueId;

pub use scheduler::{InlineScheduler, WorkerPool};

/// A unit of deferred work.
pub type MetaTask = Box<dyn FnOnce() + Send + 'static>;

/// Priority lane of a meta task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Background work for contexts that are not currently active.
    Deferred,
    /// Dependence analysis of active contexts.
    Throughput,
    /// Runtime-internal work on a critical path (window waits, messages).
    Latency,
}

/// Capability to run deferred work and track context activity.
pub trait MetaScheduler: Send + Sync {
    /// Runs `task` at `priority` after `precondition` triggers.
    fn issue(&self, priority: Priority, precondition: Event, task: MetaTask) -> Event;

    /// The context has become eligible for scheduling.
    fn activate_context(&self, ctx: UniqueId);

    /// The context is no longer eligible for scheduling.
    fn deactivate_context(&self, ctx: UniqueId);
}
