//! Synchronization primitives used at context suspension points.

pub mod event;

pub use event::{Event, EventId, UserEvent};
