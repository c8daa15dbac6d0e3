//! State shared by every context variant.
//!
//! [`ContextCore`] holds what a task was given (its region and index
//! requirements, fixed at creation) and, behind a single lock, what it did
//! with them: names it created or deleted, requirements appended for created
//! regions, physical and inline-mapped regions, and local fields. The
//! variant-specific state rides along in the same lock as `ext`.
//!
//! The fixed requirement vectors are read without the lock. Everything in
//! [`ContextState`] needs it, and no method blocks or calls a collaborator
//! while holding it.

use super::TaskContext;
use super::tracker::ResourceTracker;
use crate::error::{ContextError, ErrorKind};
use crate::forest::{RegionForest, ResourceName};
use crate::operation::{OwnerTask, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::ContextRuntime;
use crate::runtime::Priority;
use crate::sync::Event;
use crate::tracing_compat::trace;
use crate::types::{
    Coherence, FieldId, FieldSpace, IndexPartition, IndexSpace, IndexSpaceRequirement,
    LogicalRegion, PrivilegeMode, RegionRequirement, SerdezId, UniqueId,
};
use crate::wire::LocalFieldInfo;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};

/// Requirements a task context is created with.
#[derive(Debug, Clone, Default)]
pub struct TaskRegions {
    /// Region requirements, in task argument order.
    pub regions: Vec<RegionRequirement>,
    /// Index space requirements.
    pub indexes: Vec<IndexSpaceRequirement>,
    /// Index of each region's parent requirement in the enclosing context.
    pub parent_req_indexes: Vec<usize>,
    /// Whether each region was virtually mapped.
    pub virtual_mapped: Vec<bool>,
    /// Physical regions, one per region requirement. Left empty, unmapped
    /// placeholders are created.
    pub physical: Vec<PhysicalRegion>,
}

impl TaskRegions {
    /// Requirements with identity parent indexes and nothing virtual.
    #[must_use]
    pub fn new(regions: Vec<RegionRequirement>) -> Self {
        let n = regions.len();
        Self {
            regions,
            indexes: Vec::new(),
            parent_req_indexes: (0..n).collect(),
            virtual_mapped: vec![false; n],
            physical: Vec::new(),
        }
    }

    /// Sets the index space requirements.
    #[must_use]
    pub fn with_indexes(mut self, indexes: Vec<IndexSpaceRequirement>) -> Self {
        self.indexes = indexes;
        self
    }

    /// Sets the parent requirement indexes.
    #[must_use]
    pub fn with_parent_indexes(mut self, parent_req_indexes: Vec<usize>) -> Self {
        self.parent_req_indexes = parent_req_indexes;
        self
    }

    /// Sets the virtual mapping flags.
    #[must_use]
    pub fn with_virtual_mapped(mut self, virtual_mapped: Vec<bool>) -> Self {
        self.virtual_mapped = virtual_mapped;
        self
    }

    /// Supplies the physical regions the task was mapped to.
    #[must_use]
    pub fn with_physical_regions(mut self, physical: Vec<PhysicalRegion>) -> Self {
        self.physical = physical;
        self
    }
}

/// Created and deleted names of one context, by kind.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Logical regions.
    pub regions: ResourceTracker<LogicalRegion>,
    /// Fields, keyed by field space.
    pub fields: ResourceTracker<(FieldSpace, FieldId)>,
    /// Field spaces.
    pub field_spaces: ResourceTracker<FieldSpace>,
    /// Index spaces.
    pub index_spaces: ResourceTracker<IndexSpace>,
    /// Index partitions.
    pub index_partitions: ResourceTracker<IndexPartition>,
}

/// Lock-protected mutable state of a context.
pub(crate) struct ContextState<E> {
    pub(crate) created_requirements: Vec<RegionRequirement>,
    pub(crate) returnable_privileges: Vec<bool>,
    pub(crate) physical_regions: Vec<PhysicalRegion>,
    pub(crate) inline_regions: Vec<PhysicalRegion>,
    pub(crate) resources: Resources,
    pub(crate) local_fields: Vec<LocalFieldInfo>,
    pub(crate) task_executed: bool,
    pub(crate) children_complete_invoked: bool,
    pub(crate) children_commit_invoked: bool,
    pub(crate) pending_done: Event,
    pub(crate) ext: E,
}

impl<E> ContextState<E> {
    /// A created requirement is dead once its region, or the single field
    /// it was synthesized for, is no longer created.
    pub(crate) fn was_created_requirement_deleted(&self, req: &RegionRequirement) -> bool {
        if let Some(region) = req.target_region()
            && self.resources.regions.is_created(&region)
        {
            return false;
        }
        if req.privilege_fields.len() != 1 {
            return true;
        }
        req.privilege_fields.iter().next().is_none_or(|fid| {
            !self
                .resources
                .fields
                .is_created(&(req.handle.field_space(), *fid))
        })
    }

    fn push_created_requirement(&mut self, req: RegionRequirement, returnable: bool) {
        if !self.task_executed {
            self.physical_regions.push(PhysicalRegion::unmapped(req.clone()));
        }
        self.created_requirements.push(req);
        self.returnable_privileges.push(returnable);
    }
}

/// Base of every context: the task's requirements and the shared state lock.
pub struct ContextCore<E> {
    runtime: Arc<ContextRuntime>,
    info: TaskInfo,
    owner: Option<Weak<dyn OwnerTask>>,
    pub(crate) regions: Vec<RegionRequirement>,
    pub(crate) indexes: Vec<IndexSpaceRequirement>,
    pub(crate) parent_req_indexes: Vec<usize>,
    pub(crate) virtual_mapped: Vec<bool>,
    state: Mutex<ContextState<E>>,
}

impl<E> ContextCore<E> {
    pub(crate) fn new(
        runtime: Arc<ContextRuntime>,
        info: TaskInfo,
        owner: Option<&Arc<dyn OwnerTask>>,
        setup: TaskRegions,
        ext: E,
    ) -> Self {
        let TaskRegions {
            regions,
            indexes,
            mut parent_req_indexes,
            mut virtual_mapped,
            physical,
        } = setup;
        parent_req_indexes.resize(regions.len(), 0);
        virtual_mapped.resize(regions.len(), false);
        let physical_regions = if physical.len() == regions.len() {
            physical
        } else {
            regions
                .iter()
                .zip(&virtual_mapped)
                .map(|(req, &virt)| PhysicalRegion::new(req.clone(), false, virt, Vec::new()))
                .collect()
        };
        Self {
            runtime,
            info,
            owner: owner.map(Arc::downgrade),
            regions,
            indexes,
            parent_req_indexes,
            virtual_mapped,
            state: Mutex::new(ContextState {
                created_requirements: Vec::new(),
                returnable_privileges: Vec::new(),
                physical_regions,
                inline_regions: Vec::new(),
                resources: Resources::default(),
                local_fields: Vec::new(),
                task_executed: false,
                children_complete_invoked: false,
                children_commit_invoked: false,
                pending_done: Event::NONE,
                ext,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState<E>> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, ContextState<E>>> {
        self.state.try_lock()
    }

    /// Process registry this context belongs to.
    #[must_use]
    pub const fn runtime(&self) -> &Arc<ContextRuntime> {
        &self.runtime
    }

    pub(crate) fn forest(&self) -> &dyn RegionForest {
        self.runtime.forest()
    }

    /// Identity of the owning task.
    #[must_use]
    pub const fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Uid shared by this context and its remote mirrors.
    #[must_use]
    pub const fn uid(&self) -> UniqueId {
        self.info.uid
    }

    /// The owning task, while it is alive.
    #[must_use]
    pub fn owner(&self) -> Option<Arc<dyn OwnerTask>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// The task's region requirements.
    #[must_use]
    pub fn regions(&self) -> &[RegionRequirement] {
        &self.regions
    }

    /// The task's index space requirements.
    #[must_use]
    pub fn indexes(&self) -> &[IndexSpaceRequirement] {
        &self.indexes
    }

    /// Parent requirement index of each region.
    #[must_use]
    pub fn parent_req_indexes(&self) -> &[usize] {
        &self.parent_req_indexes
    }

    /// Virtual mapping flag of each region.
    #[must_use]
    pub fn virtual_mapped(&self) -> &[bool] {
        &self.virtual_mapped
    }

    /// Snapshot of the created and deleted names.
    #[must_use]
    pub fn resources(&self) -> Resources {
        self.lock().resources.clone()
    }

    /// Requirements appended for regions and fields this context created.
    #[must_use]
    pub fn created_requirements(&self) -> Vec<RegionRequirement> {
        self.lock().created_requirements.clone()
    }

    /// Whether each created requirement's privileges return to the parent.
    #[must_use]
    pub fn returnable_privileges(&self) -> Vec<bool> {
        self.lock().returnable_privileges.clone()
    }

    /// True once the task body has returned.
    #[must_use]
    pub fn task_executed(&self) -> bool {
        self.lock().task_executed
    }

    pub(crate) fn bad_parent(&self, detail: impl std::fmt::Display) -> ContextError {
        ContextError::new(
            ErrorKind::BadParentRegion,
            format!("parent task {} {detail}", self.info),
        )
    }

    // ---- created-state registration ----

    /// Records a region created by the task.
    ///
    /// The task holds full privileges on it: a returnable `READ_WRITE`
    /// requirement with no fields is appended to the created requirements.
    pub fn register_region_creation(&self, handle: LogicalRegion) {
        self.register_region_creations([handle]);
    }

    /// Batch form of [`ContextCore::register_region_creation`].
    pub fn register_region_creations(&self, handles: impl IntoIterator<Item = LogicalRegion>) {
        let mut state = self.lock();
        for handle in handles {
            trace!(ctx = %self.uid(), region = %handle, "region created");
            state.resources.regions.register_creation(handle);
            let req = RegionRequirement::region(
                handle,
                PrivilegeMode::READ_WRITE,
                Coherence::Exclusive,
                handle,
            );
            state.push_created_requirement(req, true);
        }
    }

    /// Records a region deletion, finalizing it if the task created it.
    pub fn register_region_deletion(&self, handle: LogicalRegion) {
        self.register_region_deletions([handle]);
    }

    /// Batch form of [`ContextCore::register_region_deletion`].
    pub fn register_region_deletions(&self, handles: impl IntoIterator<Item = LogicalRegion>) {
        let finalize: Vec<ResourceName> = {
            let mut state = self.lock();
            handles
                .into_iter()
                .filter(|handle| state.resources.regions.register_deletion(*handle))
                .map(ResourceName::Region)
                .collect()
        };
        self.finalize(finalize);
    }

    /// Records a field created by the task.
    pub fn register_field_creation(&self, space: FieldSpace, fid: FieldId) {
        self.register_field_creations(space, [fid]);
    }

    /// Batch form of [`ContextCore::register_field_creation`].
    pub fn register_field_creations(&self, space: FieldSpace, fids: impl IntoIterator<Item = FieldId>) {
        let mut state = self.lock();
        for fid in fids {
            state.resources.fields.register_creation((space, fid));
        }
    }

    /// Records a field deletion.
    pub fn register_field_deletion(&self, space: FieldSpace, fid: FieldId) {
        self.register_field_deletions(space, [fid]);
    }

    /// Batch form of [`ContextCore::register_field_deletion`].
    pub fn register_field_deletions(&self, space: FieldSpace, fids: impl IntoIterator<Item = FieldId>) {
        let finalize: Vec<ResourceName> = {
            let mut state = self.lock();
            fids.into_iter()
                .filter(|fid| state.resources.fields.register_deletion((space, *fid)))
                .map(|fid| ResourceName::Field(space, fid))
                .collect()
        };
        self.finalize(finalize);
    }

    /// Records a field space created by the task.
    pub fn register_field_space_creation(&self, space: FieldSpace) {
        self.lock().resources.field_spaces.register_creation(space);
    }

    /// Records a field space deletion. Deleting a created space also forgets
    /// the fields created in it.
    pub fn register_field_space_deletion(&self, space: FieldSpace) {
        let finalize = {
            let mut state = self.lock();
            let finalize = state.resources.field_spaces.register_deletion(space);
            if finalize {
                state.resources.fields.purge_created(|(fs, _)| *fs == space);
            }
            finalize
        };
        if finalize {
            self.finalize([ResourceName::FieldSpace(space)]);
        }
    }

    /// Records an index space created by the task.
    pub fn register_index_space_creation(&self, space: IndexSpace) {
        self.lock().resources.index_spaces.register_creation(space);
    }

    /// Records an index space deletion.
    pub fn register_index_space_deletion(&self, space: IndexSpace) {
        let finalize = self.lock().resources.index_spaces.register_deletion(space);
        if finalize {
            self.finalize([ResourceName::IndexSpace(space)]);
        }
    }

    /// Records an index partition created by the task.
    pub fn register_index_partition_creation(&self, partition: IndexPartition) {
        self.lock().resources.index_partitions.register_creation(partition);
    }

    /// Records an index partition deletion.
    pub fn register_index_partition_deletion(&self, partition: IndexPartition) {
        let finalize = self
            .lock()
            .resources
            .index_partitions
            .register_deletion(partition);
        if finalize {
            self.finalize([ResourceName::IndexPartition(partition)]);
        }
    }

    fn finalize(&self, names: impl IntoIterator<Item = ResourceName>) {
        for name in names {
            trace!(ctx = %self.uid(), %name, "deletion finalized");
            self.forest().finalize_deletion(name);
        }
    }

    /// True if the created requirement at `created_index` no longer names a
    /// live created region or field.
    #[must_use]
    pub fn was_created_requirement_deleted(&self, created_index: usize) -> bool {
        let state = self.lock();
        state
            .created_requirements
            .get(created_index)
            .is_none_or(|req| state.was_created_requirement_deleted(req))
    }

    // ---- requirement queries ----

    /// Copy of requirement `index`, counting static regions first and then
    /// created requirements.
    #[must_use]
    pub fn clone_requirement(&self, index: usize) -> Option<RegionRequirement> {
        if let Some(req) = self.regions.get(index) {
            return Some(req.clone());
        }
        self.lock()
            .created_requirements
            .get(index - self.regions.len())
            .cloned()
    }

    /// Privilege of requirement `index`.
    #[must_use]
    pub fn find_parent_privilege_mode(&self, index: usize) -> Option<PrivilegeMode> {
        self.clone_requirement(index).map(|req| req.privilege)
    }

    /// Region named by requirement `index`.
    #[must_use]
    pub fn find_logical_region(&self, index: usize) -> Option<LogicalRegion> {
        self.clone_requirement(index)
            .and_then(|req| req.target_region())
    }

    /// Index of the requirement whose region is `req.parent`.
    pub fn find_parent_region(&self, req: &RegionRequirement) -> Result<usize, ContextError> {
        if let Some(idx) = self
            .regions
            .iter()
            .position(|ours| ours.target_region() == Some(req.parent))
        {
            return Ok(idx);
        }
        let state = self.lock();
        state
            .created_requirements
            .iter()
            .position(|ours| ours.target_region() == Some(req.parent))
            .map(|idx| self.regions.len() + idx)
            .ok_or_else(|| {
                self.bad_parent(format!(
                    "has no region requirement for region {} as a parent of region {:?}",
                    req.parent, req.handle
                ))
            })
    }

    /// Index of the index requirement whose space is `req.parent`.
    pub fn find_parent_index_region(&self, req: &IndexSpaceRequirement) -> Result<usize, ContextError> {
        self.indexes
            .iter()
            .position(|ours| ours.handle == req.parent)
            .ok_or_else(|| {
                ContextError::new(
                    ErrorKind::BadParentIndex,
                    format!(
                        "parent task {} has no index space requirement for {} as a parent of {}",
                        self.info, req.parent, req.handle
                    ),
                )
            })
    }

    // ---- physical regions ----

    /// Physical regions, static ones first.
    #[must_use]
    pub fn physical_regions(&self) -> Vec<PhysicalRegion> {
        self.lock().physical_regions.clone()
    }

    /// Physical region at `index`.
    #[must_use]
    pub fn get_physical_region(&self, index: usize) -> Option<PhysicalRegion> {
        self.lock().physical_regions.get(index).cloned()
    }

    /// True if the physical region at `index` is mapped.
    #[must_use]
    pub fn is_region_mapped(&self, index: usize) -> bool {
        self.get_physical_region(index)
            .is_some_and(|region| region.is_mapped())
    }

    /// Tracks a region mapped by an inline map operation. Remapping one of
    /// the task's own regions is not tracked again.
    pub fn register_inline_mapped_region(&self, region: &PhysicalRegion) {
        let mut state = self.lock();
        if state.physical_regions.contains(region) || state.inline_regions.contains(region) {
            return;
        }
        state.inline_regions.push(region.clone());
    }

    /// Stops tracking an inline-mapped region.
    pub fn unregister_inline_mapped_region(&self, region: &PhysicalRegion) {
        self.lock().inline_regions.retain(|r| r != region);
    }

    /// Regions currently mapped inline.
    #[must_use]
    pub fn inline_regions(&self) -> Vec<PhysicalRegion> {
        self.lock().inline_regions.clone()
    }

    /// Unmaps every inline region and forgets them.
    pub(crate) fn unmap_inline_regions(&self) {
        let inline = std::mem::take(&mut self.lock().inline_regions);
        for region in inline {
            region.unmap();
        }
    }

    /// Unmaps every mapped physical and inline region.
    pub fn unmap_all_regions(&self) {
        let to_unmap: Vec<PhysicalRegion> = {
            let state = self.lock();
            state
                .physical_regions
                .iter()
                .chain(&state.inline_regions)
                .filter(|region| region.is_mapped())
                .cloned()
                .collect()
        };
        for region in to_unmap {
            region.unmap();
        }
    }

    // ---- local fields ----

    /// Allocates a field local to this context.
    ///
    /// If the forest allocates it, the field is reclaimed once `reclaim`
    /// triggers. Returns the recorded field.
    pub fn add_local_field(
        &self,
        handle: FieldSpace,
        fid: FieldId,
        field_size: usize,
        serdez: SerdezId,
        reclaim: Event,
    ) -> LocalFieldInfo {
        let info = LocalFieldInfo {
            handle,
            fid,
            field_size,
            serdez,
            reclaim_event: reclaim.id(),
        };
        self.allocate_local_field(&info, reclaim);
        self.lock().local_fields.push(info);
        info
    }

    /// Batch form of [`ContextCore::add_local_field`].
    pub fn add_local_fields(
        &self,
        handle: FieldSpace,
        fields: &[(FieldId, usize)],
        serdez: SerdezId,
        reclaim: &Event,
    ) -> Vec<LocalFieldInfo> {
        fields
            .iter()
            .map(|&(fid, size)| self.add_local_field(handle, fid, size, serdez, reclaim.clone()))
            .collect()
    }

    /// Allocates `info` in the forest and schedules its reclamation after
    /// `reclaim`. Returns false if the field already existed here.
    pub(crate) fn allocate_local_field(&self, info: &LocalFieldInfo, reclaim: Event) -> bool {
        if !self
            .forest()
            .allocate_field(info.handle, info.fid, info.field_size, info.serdez, true)
        {
            return false;
        }
        let runtime = Arc::clone(&self.runtime);
        let (handle, fid) = (info.handle, info.fid);
        self.runtime.scheduler().issue(
            Priority::Latency,
            reclaim,
            Box::new(move || runtime.forest().free_field(handle, fid)),
        );
        true
    }

    /// Local fields of this context.
    #[must_use]
    pub fn local_fields(&self) -> Vec<LocalFieldInfo> {
        self.lock().local_fields.clone()
    }

    // ---- completion flags ----

    /// Flips the children-complete flag once, for contexts without children.
    pub(crate) fn claim_children_complete(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.children_complete_invoked, true)
    }

    /// Flips the children-commit flag once, for contexts without children.
    pub(crate) fn claim_children_commit(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.children_commit_invoked, true)
    }

    // ---- task lifecycle ----

    /// Entry of the task body: the parent's pending count drops and the
    /// task receives its physical regions.
    pub(crate) fn start_task(&self) -> Vec<PhysicalRegion> {
        let pending_done = self
            .owner()
            .and_then(|owner| owner.parent_context())
            .map_or(Event::NONE, |parent| parent.decrement_pending());
        let mut state = self.lock();
        state.pending_done = pending_done;
        state.physical_regions.clone()
    }

    /// Exit of the task body once its close operations are issued.
    ///
    /// The result goes to the owner, the task is marked executed, mapped
    /// regions are unmapped and the owner is told about completion. The
    /// `summarize` closure runs under the lock right after the executed
    /// flag is set and decides which children callbacks fire.
    pub(crate) fn finish_task(
        &self,
        result: Vec<u8>,
        summarize: impl FnOnce(&mut ContextState<E>) -> ExecutionSummary,
    ) {
        let owner = self.owner();
        if let Some(owner) = &owner {
            owner.handle_future(result);
        }
        let (summary, unmap, pending_done) = {
            let mut state = self.lock();
            debug_assert!(!state.task_executed, "task {} ended twice", self.info);
            state.task_executed = true;
            let summary = summarize(&mut state);
            let unmap: Vec<PhysicalRegion> = state
                .physical_regions
                .iter()
                .filter(|region| region.is_mapped())
                .cloned()
                .collect();
            (summary, unmap, state.pending_done.clone())
        };
        if let (Some(owner), Some(mapped)) = (&owner, summary.mapped) {
            owner.handle_post_mapped(Event::merge(mapped));
        }
        for region in unmap {
            region.unmap();
        }
        trace!(
            ctx = %self.uid(),
            complete = summary.need_complete,
            commit = summary.need_commit,
            "task body finished"
        );
        let Some(owner) = owner else {
            return;
        };
        owner.complete_execution(pending_done);
        if summary.need_complete {
            owner.trigger_children_complete();
        }
        if summary.need_commit {
            owner.trigger_children_committed();
        }
    }
}

/// What [`ContextCore::finish_task`] reports to the owner.
pub(crate) struct ExecutionSummary {
    pub(crate) need_complete: bool,
    pub(crate) need_commit: bool,
    /// Mapped events of children still in flight; `None` for contexts
    /// that never launch children.
    pub(crate) mapped: Option<Vec<Event>>,
}

impl ExecutionSummary {
    /// Summary for a context without children: both callbacks fire once.
    pub(crate) fn childless<E>(state: &mut ContextState<E>) -> Self {
        Self {
            need_complete: !std::mem::replace(&mut state.children_complete_invoked, true),
            need_commit: !std::mem::replace(&mut state.children_commit_invoked, true),
            mapped: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::test_utils::{MemoryForest, harness_runtime_with};

    fn core(forest: &Arc<MemoryForest>) -> ContextCore<()> {
        let runtime = harness_runtime_with(RuntimeConfig::default(), Arc::clone(forest));
        let uid = runtime.next_unique_id();
        ContextCore::new(runtime, TaskInfo::new(uid, "body", 0), None, TaskRegions::default(), ())
    }

    #[test]
    fn created_region_gets_full_privilege_requirement() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let r1 = forest.new_tree(1);
        core.register_region_creation(r1);

        let resources = core.resources();
        assert!(resources.regions.is_created(&r1));
        let created = core.created_requirements();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].privilege, PrivilegeMode::READ_WRITE);
        assert_eq!(created[0].coherence, Coherence::Exclusive);
        assert!(created[0].privilege_fields.is_empty());
        assert_eq!(core.returnable_privileges(), vec![true]);
        assert_eq!(core.physical_regions().len(), 1);

        core.register_region_deletion(r1);
        let resources = core.resources();
        assert!(!resources.regions.is_created(&r1));
        assert!(!resources.regions.is_deleted(&r1));
        assert_eq!(forest.finalized(), vec![ResourceName::Region(r1)]);
    }

    #[test]
    fn inherited_deletion_is_recorded() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let r2 = forest.new_tree(2);
        core.register_region_deletion(r2);
        let resources = core.resources();
        assert!(resources.regions.is_deleted(&r2));
        assert!(!resources.regions.is_created(&r2));
        assert!(forest.finalized().is_empty());
    }

    #[test]
    fn field_space_deletion_purges_its_fields() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let fs = FieldSpace::new(3);
        core.register_field_space_creation(fs);
        core.register_field_creations(fs, [1, 2]);
        core.register_field_space_deletion(fs);
        let resources = core.resources();
        assert!(resources.fields.created().is_empty());
        assert!(!resources.field_spaces.is_created(&fs));
        assert_eq!(forest.finalized(), vec![ResourceName::FieldSpace(fs)]);
    }

    #[test]
    fn created_requirement_deletion_follows_region_and_field() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let region = forest.new_tree(4);
        core.register_region_creation(region);
        assert!(!core.was_created_requirement_deleted(0));
        core.register_region_deletion(region);
        assert!(core.was_created_requirement_deleted(0));
        assert!(core.was_created_requirement_deleted(7));
    }

    #[test]
    fn inline_region_of_own_physical_region_is_ignored() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let region = forest.new_tree(5);
        core.register_region_creation(region);
        let own = core.get_physical_region(0).expect("placeholder");
        core.register_inline_mapped_region(&own);
        assert!(core.inline_regions().is_empty());

        let req = RegionRequirement::region(region, PrivilegeMode::READ_ONLY, Coherence::Exclusive, region);
        let inline = PhysicalRegion::new(req, true, false, Vec::new());
        core.register_inline_mapped_region(&inline);
        assert_eq!(core.inline_regions(), vec![inline.clone()]);
        core.unmap_inline_regions();
        assert!(!inline.is_mapped());
        assert!(core.inline_regions().is_empty());
    }

    #[test]
    fn local_field_is_reclaimed_after_event() {
        let forest = Arc::new(MemoryForest::new());
        let core = core(&forest);
        let fs = FieldSpace::new(8);
        let reclaim = crate::sync::UserEvent::new();
        let info = core.add_local_field(fs, 12, 8, 0, reclaim.event());
        assert_eq!(info.reclaim_event, reclaim.event().id());
        assert!(forest.is_field_allocated(fs, 12));
        reclaim.trigger();
        assert!(!forest.is_field_allocated(fs, 12));
        assert_eq!(core.local_fields(), vec![info]);
    }
}
