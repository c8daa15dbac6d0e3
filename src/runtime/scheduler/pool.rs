//! Fixed-size worker pool running meta tasks.

use super::global_queue::{GlobalQueue, Job};
use crate::runtime::{MetaScheduler, MetaTask, Priority};
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{debug, trace};
use crate::types::UniqueId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct PoolShared {
    queue: GlobalQueue,
    shutdown: Mutex<bool>,
    wake: Condvar,
    active: Mutex<BTreeSet<UniqueId>>,
}

impl PoolShared {
    fn submit(&self, priority: Priority, job: Job) {
        self.queue.push(priority, job);
        // Take the parking lock so a worker between its empty check and its
        // wait cannot miss this notification.
        let _guard = self.shutdown.lock();
        self.wake.notify_one();
    }

    fn run_worker(&self) {
        loop {
            if let Some(job) = self.queue.pop() {
                (job.task)();
                job.done.trigger();
                continue;
            }
            let mut shutdown = self.shutdown.lock();
            if !self.queue.is_empty() {
                continue;
            }
            if *shutdown {
                break;
            }
            self.wake.wait(&mut shutdown);
        }
    }
}

/// A pool of worker threads draining a [`GlobalQueue`].
///
/// Dropping the pool drains the queue and joins the workers.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `threads` workers (at least one).
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: GlobalQueue::new(),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
            active: Mutex::new(BTreeSet::new()),
        });
        let workers = (0..threads.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("taskctx-meta-{idx}"))
                    .spawn(move || shared.run_worker())
                    .expect("failed to spawn meta worker")
            })
            .collect();
        debug!(threads = threads.max(1), "meta worker pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Contexts currently marked active.
    #[must_use]
    pub fn active_contexts(&self) -> Vec<UniqueId> {
        self.shared.active.lock().iter().copied().collect()
    }

    /// Number of queued, not yet running, meta tasks.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl MetaScheduler for WorkerPool {
    fn issue(&self, priority: Priority, precondition: Event, task: MetaTask) -> Event {
        let done = UserEvent::new();
        let finished = done.event();
        let shared = Arc::clone(&self.shared);
        precondition.on_trigger(move || shared.submit(priority, Job { task, done }));
        finished
    }

    fn activate_context(&self, ctx: UniqueId) {
        trace!(ctx = %ctx, "context activated");
        self.shared.active.lock().insert(ctx);
    }

    fn deactivate_context(&self, ctx: UniqueId) {
        trace!(ctx = %ctx, "context deactivated");
        self.shared.active.lock().remove(&ctx);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut shutdown = self.shared.shutdown.lock();
            *shutdown = true;
            self.shared.wake.notify_all();
        }
        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            // The last reference can be released by a meta task on a worker.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}
