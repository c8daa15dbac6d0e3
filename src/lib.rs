//! taskctx: task contexts for a distributed, task-parallel runtime.
//!
//! # Overview
//!
//! Every running task owns a *context*. Through it the task launches child
//! operations, creates and deletes regions, fields and index spaces, and
//! reports that its body returned. The context keeps the bookkeeping that
//! makes this safe:
//!
//! - **Privileges**: a child may only ask for what its parent holds
//! - **Window backpressure**: a task blocks once too many children are
//!   outstanding and resumes when the count drains below the hysteresis mark
//! - **Ordered analysis**: children are analyzed for dependences in program
//!   order, behind traces and fences
//! - **Completion protocol**: children-complete and children-committed
//!   callbacks fire exactly once, after the body returned
//! - **Distribution**: contexts are mirrored on the processes that run
//!   their children and answer version-owner and view requests remotely
//!
//! # Module Structure
//!
//! - [`context`]: the context kinds and the [`TaskContext`] interface
//! - [`registry`]: the per-process [`ContextRuntime`] and its transport seam
//! - [`types`]: identifiers, privileges and region requirements
//! - [`operation`]: interfaces of the task and operation layer
//! - [`forest`]: interface of the region-tree layer
//! - [`physical`]: physical region handles
//! - [`restrict`]: coherence restrictions, acquires and attaches
//! - [`runtime`]: meta-task scheduling
//! - [`sync`]: events
//! - [`wire`]: messages exchanged between processes
//! - [`config`]: runtime defaults and per-context configuration
//! - [`error`](mod@error): error types and exit codes
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod context;
pub mod error;
pub mod forest;
pub mod operation;
pub mod physical;
pub mod registry;
pub mod restrict;
pub mod runtime;
pub mod sync;
pub mod tracing_compat;
pub mod types;
pub mod util;
pub mod wire;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use config::{ConfigError, ContextConfiguration, RuntimeConfig};
pub use context::{
    ContextCore, ContextKind, InlineContext, InnerContext, LeafContext, TaskContext, TaskRegions,
};
pub use error::{ContextError, ErrorKind, PrivilegeError};
pub use forest::{RegionForest, ResourceName};
pub use operation::{CloseKind, Fence, InlineTask, Mapper, OpIssuer, Operation, OwnerTask, TaskInfo};
pub use physical::PhysicalRegion;
pub use registry::{ContextRuntime, Transport};
pub use runtime::{MetaScheduler, Priority};
pub use sync::{Event, UserEvent};
pub use types::{
    AddressSpace, Coherence, FieldId, FieldSpace, LogicalRegion, PrivilegeMode, RegionRequirement,
    UniqueId,
};
