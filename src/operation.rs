//! Collaborator interfaces for the task and operation layer.
//!
//! Contexts manage bookkeeping *for* tasks and child operations; they never
//! run them. Everything the context needs from that layer is expressed as a
//! trait here and implemented by the embedding runtime.

use crate::config::ContextConfiguration;
use crate::context::InnerContext;
use crate::physical::PhysicalRegion;
use crate::sync::Event;
use crate::types::{RegionRequirement, TraceId, UniqueId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of the task a context belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Unique id of the task.
    pub uid: UniqueId,
    /// Human-readable task name, used in error messages.
    pub name: String,
    /// Nesting depth; the top-level task's context has depth -1.
    pub depth: i32,
}

impl TaskInfo {
    /// Creates a task identity.
    #[must_use]
    pub fn new(uid: UniqueId, name: impl Into<String>, depth: i32) -> Self {
        Self {
            uid,
            name: name.into(),
            depth,
        }
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ID {})", self.name, self.uid)
    }
}

/// A child operation launched by a context.
pub trait Operation: Send + Sync {
    /// Unique id of the operation.
    fn unique_id(&self) -> UniqueId;

    /// Whether the operation is tracked in the parent's child sets.
    fn is_tracking_parent(&self) -> bool {
        true
    }

    /// Marks the operation as part of `trace`; `capturing` is true while the
    /// trace is still being recorded.
    fn set_trace(&self, trace: TraceId, capturing: bool);

    /// Records a mapping dependence on `fence` at generation `generation`.
    ///
    /// Returns true if the fence has already committed, in which case the
    /// caller may drop its reference to it.
    fn register_dependence(&self, fence: &dyn Fence, generation: u64) -> bool;

    /// Runs logical dependence analysis. Called from the context's
    /// dependence queue, in program order.
    fn execute_dependence_analysis(&self);

    /// Triggers once the operation has mapped.
    fn mapped_event(&self) -> Event {
        Event::NONE
    }
}

/// A fence operation: a total-order point for later children.
pub trait Fence: Operation {
    /// Current generation of the fence object.
    fn generation(&self) -> u64;

    /// Keeps the fence alive for mapping at `generation`.
    fn add_mapping_reference(&self, generation: u64);

    /// Drops a reference taken by [`Fence::add_mapping_reference`].
    fn remove_mapping_reference(&self, generation: u64);
}

/// The task that owns a context.
pub trait OwnerTask: Send + Sync {
    /// Identity of the task.
    fn info(&self) -> TaskInfo;

    /// Context the task was launched from, if any.
    fn parent_context(&self) -> Option<Arc<dyn crate::context::TaskContext>>;

    /// Event that triggers when the task completes.
    fn completion_event(&self) -> Event;

    /// Every child has finished executing.
    fn trigger_children_complete(&self);

    /// Every child has committed.
    fn trigger_children_committed(&self);

    /// The task body has returned; `precondition` guards the pending count
    /// decrement in the parent.
    fn complete_execution(&self, precondition: Event);

    /// Hands the task's return value to the future layer.
    fn handle_future(&self, result: Vec<u8>);

    /// All children of a non-leaf task are mapped once `precondition` fires.
    fn handle_post_mapped(&self, precondition: Event);

    /// Serialized version state for region `index`; `full` asks for the
    /// complete state rather than version numbers only.
    fn pack_version_state(&self, index: usize, full: bool) -> Vec<u8>;

    /// True if any region of a leaf task was virtually mapped.
    fn has_virtual_instances(&self) -> bool {
        false
    }
}

/// A child task being executed inline in its parent's context.
pub trait InlineTask: Operation {
    /// Identity of the child task.
    fn info(&self) -> TaskInfo;

    /// Region requirements of the child.
    fn regions(&self) -> Vec<RegionRequirement>;

    /// Resolved predicate value; a false predicate skips the child.
    fn predicate_value(&self) -> bool {
        true
    }

    /// Runs the child body in the caller's thread.
    fn perform_inlining(&self);

    /// The inlined body returned `result`.
    fn end_inline_task(&self, result: Vec<u8>);
}

/// Mapper hook for per-context scheduling configuration.
pub trait Mapper: Send + Sync {
    /// Name used in error messages.
    fn name(&self) -> &str;

    /// Adjusts `config`, which starts at the runtime defaults.
    fn configure_context(&self, task: &TaskInfo, config: &mut ContextConfiguration);
}

/// Kind of close operation issued at task end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseKind {
    /// Flushes a written, physically mapped region back to its instance.
    Post,
    /// Closes a written region that was virtually mapped.
    Virtual,
}

/// Creates and launches the runtime-internal operations a context needs.
pub trait OpIssuer: Send + Sync {
    /// Issues a mapping fence in `ctx`.
    fn issue_mapping_fence(&self, ctx: &Arc<InnerContext>);

    /// Issues the operation that records a newly captured trace.
    fn issue_trace_capture(&self, ctx: &Arc<InnerContext>, trace: TraceId);

    /// Issues the operation that completes a replayed trace.
    fn issue_trace_complete(&self, ctx: &Arc<InnerContext>, trace: TraceId);

    /// Issues a close operation for region `index` of `ctx`.
    fn issue_close(&self, ctx: &Arc<InnerContext>, index: usize, kind: CloseKind);

    /// Issues a map operation that remaps `region`; the returned event
    /// triggers once it is mapped again.
    fn issue_remap(&self, ctx: &Arc<InnerContext>, region: &PhysicalRegion) -> Event;
}
