//! Meta-task scheduler implementations.

pub mod global_queue;
pub mod inline;
pub mod pool;

pub use global_queue::{GlobalQueue, Job};
pub use inline::{Activation, InlineScheduler};
pub use pool::WorkerPool;
