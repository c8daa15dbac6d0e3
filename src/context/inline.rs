//! Contexts of child tasks inlined into their parent.
//!
//! An inlined child runs in the parent's thread against the parent's
//! physical state. Its context keeps only the child's requirements,
//! re-parented to the parents the enclosing context knows, so privilege
//! checks resolve against the enclosing task. Everything else, children
//! included, goes to the enclosing context.

use super::core::{ContextCore, TaskRegions};
use super::{ContextKind, InnerContext, TaskContext};
use crate::error::{ContextError, ErrorKind};
use crate::operation::{InlineTask, Operation, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::ContextRuntime;
use crate::sync::Event;
use crate::tracing_compat::{debug, trace};
use crate::types::{AddressSpace, RegionRequirement, RegionTreeNode, UniqueId};
use crate::wire::{LocalFieldInfo, RemoteContextPayload};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Context of a child task executing inline in its parent.
pub struct InlineContext {
    core: ContextCore<()>,
    enclosing: Weak<dyn TaskContext>,
    inline_task: Arc<dyn InlineTask>,
}

impl fmt::Debug for InlineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineContext")
            .field("uid", &self.uid())
            .field("task", &self.info().name)
            .finish_non_exhaustive()
    }
}

impl Deref for InlineContext {
    type Target = ContextCore<()>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl InlineContext {
    /// Creates the context of `child` inside `enclosing`.
    ///
    /// Each of the child's requirements must have a parent requirement in
    /// `enclosing`. Static parents lend their physical region; regions the
    /// enclosing task created have none and are treated as virtual.
    pub fn new(enclosing: &Arc<dyn TaskContext>, child: Arc<dyn InlineTask>) -> Result<Arc<Self>, ContextError> {
        let mut regions = child.regions();
        let mut parent_req_indexes = Vec::with_capacity(regions.len());
        let mut virtual_mapped = Vec::with_capacity(regions.len());
        let mut physical = Vec::with_capacity(regions.len());
        for req in &mut regions {
            let index = enclosing.find_parent_region(req)?;
            let parent = enclosing.clone_requirement(index).ok_or_else(|| {
                ContextError::new(
                    ErrorKind::BadParentRegion,
                    format!("enclosing task {} lost requirement {index}", enclosing.task_info()),
                )
            })?;
            req.parent = parent.parent;
            parent_req_indexes.push(index);
            let lent = (index < enclosing.num_regions())
                .then(|| enclosing.get_physical_region(index))
                .flatten();
            virtual_mapped.push(lent.is_none());
            physical.push(lent.unwrap_or_else(|| PhysicalRegion::new(req.clone(), false, true, Vec::new())));
        }
        let setup = TaskRegions::new(regions)
            .with_parent_indexes(parent_req_indexes)
            .with_virtual_mapped(virtual_mapped)
            .with_physical_regions(physical);
        let core = ContextCore::new(Arc::clone(enclosing.runtime()), child.info(), None, setup, ());
        let ctx = Arc::new(Self {
            core,
            enclosing: Arc::downgrade(enclosing),
            inline_task: child,
        });
        debug!(
            ctx = %ctx.uid(),
            enclosing = %enclosing.context_uid(),
            regions = ctx.regions().len(),
            "inline context created"
        );
        Ok(ctx)
    }

    /// The enclosing context, while it is alive.
    #[must_use]
    pub fn enclosing(&self) -> Option<Arc<dyn TaskContext>> {
        self.enclosing.upgrade()
    }

    fn require_enclosing(&self) -> Result<Arc<dyn TaskContext>, ContextError> {
        self.enclosing().ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("inline task {} outlived its enclosing context", self.info()),
            )
        })
    }
}

impl TaskContext for InlineContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Inline
    }

    /// The enclosing context's uid; an inline context is not addressable
    /// on its own.
    fn context_uid(&self) -> UniqueId {
        self.enclosing()
            .map_or_else(|| self.uid(), |enclosing| enclosing.context_uid())
    }

    fn task_info(&self) -> &TaskInfo {
        self.info()
    }

    fn runtime(&self) -> &Arc<ContextRuntime> {
        self.core.runtime()
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        self.enclosing()?.find_parent_context()
    }

    fn find_outermost_local_context(&self, previous: Option<Arc<InnerContext>>) -> Option<Arc<InnerContext>> {
        match self.enclosing() {
            Some(enclosing) => enclosing.find_outermost_local_context(previous),
            None => previous,
        }
    }

    fn find_top_context(&self) -> Option<Arc<InnerContext>> {
        self.enclosing()?.find_top_context()
    }

    fn find_parent_logical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        let parent_index = *self.parent_req_indexes.get(index)?;
        self.enclosing()?.find_parent_logical_context(parent_index)
    }

    fn find_parent_physical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        let parent_index = *self.parent_req_indexes.get(index)?;
        self.enclosing()?.find_parent_physical_context(parent_index)
    }

    fn get_version_owner(&self, node: RegionTreeNode, source: AddressSpace) -> Result<AddressSpace, ContextError> {
        self.require_enclosing()?.get_version_owner(node, source)
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.find_enclosing_local_fields(out);
        }
        out.extend(self.local_fields());
    }

    fn pack_remote_context(&self, target: AddressSpace) -> Result<RemoteContextPayload, ContextError> {
        self.require_enclosing()?.pack_remote_context(target)
    }

    fn register_new_child_operation(&self, op: &Arc<dyn Operation>) -> Result<usize, ContextError> {
        self.require_enclosing()?.register_new_child_operation(op)
    }

    fn add_to_dependence_queue(&self, op: Arc<dyn Operation>, precondition: Event) -> Result<Event, ContextError> {
        self.require_enclosing()?.add_to_dependence_queue(op, precondition)
    }

    fn register_child_executed(&self, op: UniqueId) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.register_child_executed(op);
        }
    }

    fn register_child_complete(&self, op: UniqueId) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.register_child_complete(op);
        }
    }

    fn register_child_commit(&self, op: UniqueId) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.register_child_commit(op);
        }
    }

    fn unregister_child_operation(&self, op: UniqueId) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.unregister_child_operation(op);
        }
    }

    fn register_fence_dependence(&self, op: &dyn Operation) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.register_fence_dependence(op);
        }
    }

    fn increment_pending(&self) {
        if let Some(enclosing) = self.enclosing() {
            enclosing.increment_pending();
        }
    }

    fn decrement_pending(&self) -> Event {
        self.enclosing()
            .map_or(Event::NONE, |enclosing| enclosing.decrement_pending())
    }

    /// Resolves against the inline requirements first, reporting the
    /// enclosing context's index, then against the enclosing context.
    fn find_parent_region(&self, req: &RegionRequirement) -> Result<usize, ContextError> {
        if let Ok(idx) = self.core.find_parent_region(req)
            && let Some(parent_index) = self.parent_req_indexes.get(idx)
        {
            return Ok(*parent_index);
        }
        self.require_enclosing()?.find_parent_region(req)
    }

    fn num_regions(&self) -> usize {
        self.enclosing()
            .map_or(0, |enclosing| enclosing.num_regions())
    }

    fn clone_requirement(&self, index: usize) -> Option<RegionRequirement> {
        self.enclosing()?.clone_requirement(index)
    }

    fn get_physical_region(&self, index: usize) -> Option<PhysicalRegion> {
        self.enclosing()?.get_physical_region(index)
    }

    fn physical_regions(&self) -> Vec<PhysicalRegion> {
        self.enclosing()
            .map(|enclosing| enclosing.physical_regions())
            .unwrap_or_default()
    }

    fn begin_task(&self) -> Vec<PhysicalRegion> {
        self.physical_regions()
    }

    fn end_task(&self, result: Vec<u8>) -> Result<(), ContextError> {
        self.post_end_task(result);
        Ok(())
    }

    fn post_end_task(&self, result: Vec<u8>) {
        trace!(ctx = %self.uid(), "inline task finished");
        self.inline_task.end_inline_task(result);
    }

    fn attempt_children_complete(&self) -> bool {
        false
    }

    fn attempt_children_commit(&self) -> bool {
        false
    }

    fn inline_child_task(&self, child: &Arc<dyn InlineTask>) -> Result<(), ContextError> {
        self.require_enclosing()?.inline_child_task(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::operation::OwnerTask;
    use crate::test_utils::{MemoryForest, RecordingOwner, TestInlineTask, TestOp, harness_runtime_with};
    use crate::types::{Coherence, LogicalRegion, ManagerId, PrivilegeMode};

    fn rw(region: LogicalRegion, parent: LogicalRegion) -> RegionRequirement {
        RegionRequirement::region(region, PrivilegeMode::READ_WRITE, Coherence::Exclusive, parent).with_fields([1])
    }

    struct Fixture {
        forest: Arc<MemoryForest>,
        runtime: Arc<ContextRuntime>,
        _owner: Arc<RecordingOwner>,
        parent: Arc<InnerContext>,
        root: LogicalRegion,
        mapped: PhysicalRegion,
    }

    fn fixture() -> Fixture {
        let forest = Arc::new(MemoryForest::new());
        let root = forest.new_tree(1);
        let runtime = harness_runtime_with(RuntimeConfig::default(), Arc::clone(&forest));
        let owner = RecordingOwner::new(&runtime, "enclosing");
        let dyn_owner: Arc<dyn OwnerTask> = owner.clone();
        let mapped = PhysicalRegion::new(rw(root, root), true, false, vec![ManagerId(1)]);
        let setup = TaskRegions::new(vec![rw(root, root)]).with_physical_regions(vec![mapped.clone()]);
        let parent = InnerContext::new(&runtime, &dyn_owner, setup);
        Fixture {
            forest,
            runtime,
            _owner: owner,
            parent,
            root,
            mapped,
        }
    }

    fn enclosing(f: &Fixture) -> Arc<dyn TaskContext> {
        f.parent.clone()
    }

    #[test]
    fn requirements_are_reparented_and_regions_lent() {
        let f = fixture();
        let sub = f.forest.new_subregion(f.root);
        let child = TestInlineTask::new(f.runtime.next_unique_id(), "inlined", vec![rw(sub, sub)]);
        let Err(err) = InlineContext::new(&enclosing(&f), child) else {
            panic!("sub is not a parent requirement");
        };
        assert_eq!(err.kind(), ErrorKind::BadParentRegion);

        let child = TestInlineTask::new(f.runtime.next_unique_id(), "inlined", vec![rw(sub, f.root)]);
        let ctx = InlineContext::new(&enclosing(&f), child).expect("parent found");
        assert_eq!(ctx.parent_req_indexes(), &[0]);
        assert_eq!(ctx.regions()[0].parent, f.root);
        assert_eq!(ctx.virtual_mapped(), &[false]);
        assert_eq!(ctx.begin_task(), vec![f.mapped.clone()]);
        assert_eq!(ctx.context_uid(), f.parent.uid());
        assert_eq!(ctx.kind(), ContextKind::Inline);
        assert!(ctx.check_privilege(&rw(sub, sub)).is_ok());
    }

    #[test]
    fn created_parents_are_virtual() {
        let f = fixture();
        let created = f.forest.new_tree(2);
        f.parent.register_region_creation(created);
        let child = TestInlineTask::new(f.runtime.next_unique_id(), "inlined", vec![rw(created, created)]);
        let ctx = InlineContext::new(&enclosing(&f), child).expect("created parent");
        assert_eq!(ctx.parent_req_indexes(), &[1]);
        assert_eq!(ctx.virtual_mapped(), &[true]);
        assert!(ctx.get_physical_region(1).is_some());
        assert!(ctx.core.get_physical_region(0).is_some_and(|r| r.is_virtual()));
    }

    #[test]
    fn children_and_results_go_to_the_right_place() {
        let f = fixture();
        let sub = f.forest.new_subregion(f.root);
        let child = TestInlineTask::new(f.runtime.next_unique_id(), "inlined", vec![rw(sub, f.root)]);
        let ctx = InlineContext::new(&enclosing(&f), child.clone()).expect("parent found");

        let op: Arc<dyn Operation> = TestOp::new(f.runtime.next_unique_id());
        assert_eq!(ctx.register_new_child_operation(&op), Ok(0));
        assert_eq!(f.parent.outstanding_children(), 1);
        assert_eq!(ctx.find_parent_region(&rw(sub, sub)), Ok(0));

        ctx.end_task(b"inline".to_vec()).expect("end");
        assert_eq!(child.results(), vec![b"inline".to_vec()]);
        assert!(!f.parent.task_executed());
        assert!(!ctx.attempt_children_complete());
    }

    #[test]
    fn dropped_enclosing_context_is_reported() {
        let f = fixture();
        let sub = f.forest.new_subregion(f.root);
        let child = TestInlineTask::new(f.runtime.next_unique_id(), "inlined", vec![rw(sub, f.root)]);
        let ctx = InlineContext::new(&enclosing(&f), child).expect("parent found");
        let Fixture { parent, .. } = f;
        drop(parent);
        let op: Arc<dyn Operation> = TestOp::new(UniqueId::new(99));
        let err = ctx.register_new_child_operation(&op).expect_err("enclosing gone");
        assert_eq!(err.kind(), ErrorKind::MissingContext);
        assert!(ctx.physical_regions().is_empty());
    }
}
