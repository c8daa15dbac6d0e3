//! Global injection queue with priority lanes.
//!
//! Meta tasks become runnable from whatever thread triggers their
//! precondition, so the queue is a set of lock-free unbounded lanes. Workers
//! always drain the highest non-empty lane first.

use crate::runtime::{MetaTask, Priority};
use crate::sync::UserEvent;
use crossbeam_queue::SegQueue;
use std::fmt;

/// A runnable meta task and the event to trigger once it has run.
pub struct Job {
    /// Work to run.
    pub task: MetaTask,
    /// Triggered after `task` returns.
    pub done: UserEvent,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("done", &self.done).finish_non_exhaustive()
    }
}

/// Three-lane global queue.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    latency: SegQueue<Job>,
    throughput: SegQueue<Job>,
    deferred: SegQueue<Job>,
}

impl GlobalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, priority: Priority) -> &SegQueue<Job> {
        match priority {
            Priority::Latency => &self.latency,
            Priority::Throughput => &self.throughput,
            Priority::Deferred => &self.deferred,
        }
    }

    /// Pushes a job onto its lane.
    pub fn push(&self, priority: Priority, job: Job) {
        self.lane(priority).push(job);
    }

    /// Pops from the highest non-empty lane.
    pub fn pop(&self) -> Option<Job> {
        self.latency
            .pop()
            .or_else(|| self.throughput.pop())
            .or_else(|| self.deferred.pop())
    }

    /// Number of queued jobs across all lanes.
    pub fn len(&self) -> usize {
        self.latency.len() + self.throughput.len() + self.deferred.len()
    }

    /// True if every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.latency.is_empty() && self.throughput.is_empty() && self.deferred.is_empty()
    }
}
