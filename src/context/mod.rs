//! Task contexts.
//!
//! Every running task gets a context: the object through which it launches
//! children, creates and deletes names, and reports that its body returned.
//! Contexts come in five kinds:
//!
//! | Kind | Type | Launches children | Lives on |
//! |------|------|-------------------|----------|
//! | task | [`InnerContext`] | yes | the task's process |
//! | top-level | [`InnerContext`] | yes | every process, one each |
//! | remote | [`InnerContext`] | no, mirror only | processes running its children |
//! | leaf | [`LeafContext`] | no | the task's process |
//! | inline | [`InlineContext`] | through the enclosing context | the enclosing task's thread |
//!
//! The shared base is [`ContextCore`]; [`TaskContext`] is the interface the
//! rest of the runtime programs against, so parents and children can be of
//! any kind.

mod conflict;
mod core;
mod destroy;
mod gating;
mod inline;
mod inner;
mod leaf;
mod privilege;
mod remote;
mod trace;
mod tracker;
mod version;
mod views;

pub use self::core::{ContextCore, Resources, TaskRegions};
pub use conflict::ConflictInfo;
pub use destroy::DeleteRequirement;
pub use inline::InlineContext;
pub use inner::{InnerContext, InnerState};
pub use leaf::LeafContext;
pub use trace::Trace;
pub use tracker::ResourceTracker;

use crate::error::ContextError;
use crate::operation::{InlineTask, Operation, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::ContextRuntime;
use crate::sync::Event;
use crate::types::{AddressSpace, RegionRequirement, RegionTreeNode, UniqueId};
use crate::wire::{LocalFieldInfo, RemoteContextPayload};
use std::sync::Arc;

/// Which kind of context a [`TaskContext`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Context of a task that may launch children.
    Task,
    /// The per-process root context.
    TopLevel,
    /// Mirror of a context living on another process.
    Remote,
    /// Context of a task that launches nothing.
    Leaf,
    /// Context of a child running in its parent's thread.
    Inline,
}

impl ContextKind {
    /// True for kinds that may register child operations.
    #[must_use]
    pub const fn launches_children(self) -> bool {
        matches!(self, Self::Task | Self::TopLevel | Self::Inline)
    }
}

/// The interface every context kind implements.
///
/// Child operations and the owning task only ever see this trait.
pub trait TaskContext: Send + Sync {
    /// Kind of this context.
    fn kind(&self) -> ContextKind;

    /// Uid of the context; equal to its task's uid.
    fn context_uid(&self) -> UniqueId;

    /// Identity of the owning task.
    fn task_info(&self) -> &TaskInfo;

    /// Registry of the process the context lives on.
    fn runtime(&self) -> &Arc<ContextRuntime>;

    /// This context as an [`InnerContext`], if it is one.
    fn as_inner(&self) -> Option<Arc<InnerContext>> {
        None
    }

    // ---- lookup chain ----

    /// Context the owning task was launched from.
    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>>;

    /// Outermost enclosing inner context on this process, or `previous`
    /// once the chain leaves the process.
    fn find_outermost_local_context(&self, previous: Option<Arc<InnerContext>>) -> Option<Arc<InnerContext>>;

    /// The top-level context at the root of the chain.
    fn find_top_context(&self) -> Option<Arc<InnerContext>>;

    /// Context holding the logical state of requirement `index`.
    fn find_parent_logical_context(&self, index: usize) -> Option<Arc<InnerContext>>;

    /// Context holding the physical state of requirement `index`.
    fn find_parent_physical_context(&self, index: usize) -> Option<Arc<InnerContext>>;

    /// Process owning the version state of `node`, as asked by `source`.
    fn get_version_owner(&self, node: RegionTreeNode, source: AddressSpace) -> Result<AddressSpace, ContextError>;

    /// Appends the local fields of this context and every enclosing one.
    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>);

    /// Snapshot of the context for a mirror on `target`.
    fn pack_remote_context(&self, target: AddressSpace) -> Result<RemoteContextPayload, ContextError>;

    // ---- child operations ----

    /// Registers a child and returns its index.
    fn register_new_child_operation(&self, op: &Arc<dyn Operation>) -> Result<usize, ContextError>;

    /// Queues a child for dependence analysis behind earlier children.
    fn add_to_dependence_queue(&self, op: Arc<dyn Operation>, precondition: Event) -> Result<Event, ContextError>;

    /// A child finished executing.
    fn register_child_executed(&self, op: UniqueId);

    /// A child completed.
    fn register_child_complete(&self, op: UniqueId);

    /// A child committed.
    fn register_child_commit(&self, op: UniqueId);

    /// Forgets a child that will never run.
    fn unregister_child_operation(&self, op: UniqueId);

    /// Makes `op` depend on the current fence.
    fn register_fence_dependence(&self, op: &dyn Operation);

    /// A child task was mapped and waits to run.
    fn increment_pending(&self);

    /// A pending child task started running.
    fn decrement_pending(&self) -> Event;

    // ---- regions ----

    /// Index of the requirement that is `req`'s parent.
    fn find_parent_region(&self, req: &RegionRequirement) -> Result<usize, ContextError>;

    /// Number of static region requirements.
    fn num_regions(&self) -> usize;

    /// Copy of requirement `index`, static ones first, then created ones.
    fn clone_requirement(&self, index: usize) -> Option<RegionRequirement>;

    /// Physical region at `index`.
    fn get_physical_region(&self, index: usize) -> Option<PhysicalRegion>;

    /// All physical regions.
    fn physical_regions(&self) -> Vec<PhysicalRegion>;

    // ---- task lifecycle ----

    /// Entry of the task body.
    fn begin_task(&self) -> Vec<PhysicalRegion>;

    /// Exit of the task body.
    fn end_task(&self, result: Vec<u8>) -> Result<(), ContextError>;

    /// Second half of [`TaskContext::end_task`], once closes are issued.
    fn post_end_task(&self, result: Vec<u8>);

    /// Fires the children-complete callback if it is due.
    fn attempt_children_complete(&self) -> bool;

    /// Fires the children-committed callback if it is due.
    fn attempt_children_commit(&self) -> bool;

    /// Runs `child` in the calling thread.
    fn inline_child_task(&self, child: &Arc<dyn InlineTask>) -> Result<(), ContextError>;
}
