//! Contexts of tasks that launch children.
//!
//! An [`InnerContext`] tracks every child operation through
//! `executing -> executed -> complete -> committed`, throttles the task when
//! too many children are outstanding, orders logical dependence analysis,
//! and owns the region-tree context its children analyze against.
//!
//! Three flavors share the type and differ only in how they resolve their
//! parent and version owners:
//!
//! - a task context belongs to a task running on this process
//! - the top-level context has no parent and depth -1
//! - a remote context mirrors a context living on another process
//!
//! Scheduling gates, traces and fences, version ownership, view caching and
//! mirroring are implemented in sibling modules.

use super::core::{ContextCore, ContextState, ExecutionSummary, TaskRegions};
use super::gating::Gate;
use super::remote::RemoteInfo;
use super::trace::Trace;
use super::{ContextKind, TaskContext};
use crate::config::ContextConfiguration;
use crate::error::{ContextError, ErrorKind};
use crate::operation::{CloseKind, Fence, InlineTask, Mapper, Operation, OwnerTask, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::ContextRuntime;
use crate::restrict::{RestrictInfo, RestrictionSet};
use crate::runtime::Priority;
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::{
    AddressSpace, Coherence, ManagerId, PrivilegeMode, RegionRequirement, RegionTreeContext,
    RegionTreeNode, RequirementFlags, TraceId, UniqueId, ViewId,
};
use crate::util::{DetHashMap, DetHashSet};
use crate::wire::{LocalFieldInfo, Message, RemoteContextPayload};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Which process recorded itself as owner of a node's version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionOwner {
    pub(crate) space: AddressSpace,
    /// Only remote processes have used the node so far.
    pub(crate) remote_only: bool,
}

/// Variant state of an [`InnerContext`], kept behind the context lock.
pub struct InnerState {
    pub(crate) config: ContextConfiguration,
    pub(crate) executing_children: DetHashMap<UniqueId, Arc<dyn Operation>>,
    pub(crate) executed_children: DetHashMap<UniqueId, Arc<dyn Operation>>,
    pub(crate) complete_children: DetHashSet<UniqueId>,
    pub(crate) total_children_count: usize,
    pub(crate) total_close_count: usize,
    pub(crate) window_wait: Option<UserEvent>,
    pub(crate) dependence_tail: Event,
    pub(crate) current_trace: Option<TraceId>,
    pub(crate) traces: DetHashMap<TraceId, Trace>,
    pub(crate) current_fence: Option<(Arc<dyn Fence>, u64)>,
    pub(crate) frame_events: VecDeque<Event>,
    pub(crate) gate: Gate,
    pub(crate) version_owners: DetHashMap<RegionTreeNode, VersionOwner>,
    pub(crate) pending_version_owners: DetHashMap<RegionTreeNode, UserEvent>,
    pub(crate) top_views: DetHashMap<ManagerId, ViewId>,
    /// Local constructions in flight; the event is created by the first
    /// caller that has to wait.
    pub(crate) pending_top_views: DetHashMap<ManagerId, Option<UserEvent>>,
    pub(crate) pending_remote_views: DetHashMap<ManagerId, UserEvent>,
    pub(crate) restrictions: RestrictionSet,
    pub(crate) remote_instances: BTreeSet<AddressSpace>,
}

impl InnerState {
    fn new(config: ContextConfiguration) -> Self {
        Self {
            config,
            executing_children: DetHashMap::default(),
            executed_children: DetHashMap::default(),
            complete_children: DetHashSet::default(),
            total_children_count: 0,
            total_close_count: 0,
            window_wait: None,
            dependence_tail: Event::NONE,
            current_trace: None,
            traces: DetHashMap::default(),
            current_fence: None,
            frame_events: VecDeque::new(),
            gate: Gate::default(),
            version_owners: DetHashMap::default(),
            pending_version_owners: DetHashMap::default(),
            top_views: DetHashMap::default(),
            pending_top_views: DetHashMap::default(),
            pending_remote_views: DetHashMap::default(),
            restrictions: RestrictionSet::new(),
            remote_instances: BTreeSet::new(),
        }
    }

    fn children_idle(&self) -> bool {
        self.executing_children.is_empty() && self.executed_children.is_empty()
    }
}

pub(crate) enum Variant {
    Task,
    TopLevel,
    Remote(RemoteInfo),
}

/// Context of a task that may launch child operations.
pub struct InnerContext {
    core: ContextCore<InnerState>,
    pub(crate) variant: Variant,
    tree_context: RegionTreeContext,
    outstanding_children: AtomicUsize,
    self_ref: Weak<Self>,
}

impl Deref for InnerContext {
    type Target = ContextCore<InnerState>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl InnerContext {
    pub(crate) fn build(
        runtime: &Arc<ContextRuntime>,
        info: TaskInfo,
        owner: Option<&Arc<dyn OwnerTask>>,
        setup: TaskRegions,
        variant: Variant,
    ) -> Arc<Self> {
        let config = ContextConfiguration::from_runtime(runtime.config());
        let tree_context = runtime.forest().allocate_context();
        let core = ContextCore::new(Arc::clone(runtime), info, owner, setup, InnerState::new(config));
        Arc::new_cyclic(|self_ref| Self {
            core,
            variant,
            tree_context,
            outstanding_children: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    /// Creates the context of `owner`, a task running on this process, and
    /// registers it with the runtime.
    pub fn new(runtime: &Arc<ContextRuntime>, owner: &Arc<dyn OwnerTask>, setup: TaskRegions) -> Arc<Self> {
        let ctx = Self::build(runtime, owner.info(), Some(owner), setup, Variant::Task);
        runtime.register_context(&ctx);
        debug!(ctx = %ctx.uid(), task = %ctx.info().name, "task context created");
        ctx
    }

    /// Creates this process's top-level context: no parent, no owner,
    /// depth -1.
    pub fn new_top_level(runtime: &Arc<ContextRuntime>) -> Arc<Self> {
        let info = TaskInfo::new(runtime.next_unique_id(), "top_level", -1);
        let ctx = Self::build(runtime, info, None, TaskRegions::default(), Variant::TopLevel);
        runtime.register_context(&ctx);
        debug!(ctx = %ctx.uid(), "top-level context created");
        ctx
    }

    pub(crate) fn arc(&self) -> Result<Arc<Self>, ContextError> {
        self.self_ref.upgrade().ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("context {} is being torn down", self.uid()),
            )
        })
    }

    /// Which flavor of inner context this is.
    #[must_use]
    pub const fn context_kind(&self) -> ContextKind {
        match &self.variant {
            Variant::Task => ContextKind::Task,
            Variant::TopLevel => ContextKind::TopLevel,
            Variant::Remote(_) => ContextKind::Remote,
        }
    }

    /// Region-tree context children of this task analyze against.
    #[must_use]
    pub const fn tree_context(&self) -> RegionTreeContext {
        self.tree_context
    }

    /// Children registered but not yet executed or unregistered.
    #[must_use]
    pub fn outstanding_children(&self) -> usize {
        self.outstanding_children.load(Ordering::Acquire)
    }

    /// Scheduling configuration currently in effect.
    #[must_use]
    pub fn configuration(&self) -> ContextConfiguration {
        self.lock().ext.config
    }

    /// Lets `mapper` choose this context's scheduling configuration.
    ///
    /// The configuration starts at the runtime defaults. A mapper that
    /// zeroes both scheduling minimums is rejected; a nonzero frame minimum
    /// disables the task minimum.
    pub fn configure_context(&self, mapper: &dyn Mapper) -> Result<ContextConfiguration, ContextError> {
        let mut config = ContextConfiguration::from_runtime(self.runtime().config());
        mapper.configure_context(self.info(), &mut config);
        let config = config.validate().map_err(|_| {
            let err = ContextError::new(
                ErrorKind::InvalidContextConfiguration,
                format!(
                    "invalid output from mapper {} call configure_context on task {}: \
                     min_tasks_to_schedule and min_frames_to_schedule cannot both be zero",
                    mapper.name(),
                    self.info()
                ),
            );
            error!(ctx = %self.uid(), mapper = mapper.name(), "{err}");
            err
        })?;
        self.lock().ext.config = config;
        debug!(
            ctx = %self.uid(),
            window = config.max_window_size,
            frames = config.max_outstanding_frames,
            min_tasks = config.min_tasks_to_schedule,
            min_frames = config.min_frames_to_schedule,
            "context configured"
        );
        Ok(config)
    }

    // ---- child operations ----

    /// Registers a child operation and returns its index in this context.
    ///
    /// Indexes increase strictly. If the window is full the calling thread
    /// blocks until enough children executed to drain it to the hysteresis
    /// threshold.
    pub fn register_new_child_operation(&self, op: &Arc<dyn Operation>) -> usize {
        let (index, trace, config) = {
            let mut state = self.lock();
            let index = state.ext.total_children_count;
            state.ext.total_children_count += 1;
            let trace = state
                .ext
                .current_trace
                .map(|id| (id, state.ext.traces.get(&id).is_some_and(Trace::is_fixed)));
            (index, trace, state.ext.config)
        };
        if let Some((id, fixed)) = trace {
            op.set_trace(id, !fixed);
        }
        if config.min_frames_to_schedule == 0
            && config.max_window_size > 0
            && self.outstanding_children() >= config.max_window_size
        {
            self.wait_for_window();
        }
        let outstanding = self.outstanding_children.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(ctx = %self.uid(), op = %op.unique_id(), index, outstanding, "child registered");
        index
    }

    /// Hands out the next close operation index. Closes are numbered apart
    /// from children.
    pub fn register_new_close_operation(&self) -> usize {
        let mut state = self.lock();
        let index = state.ext.total_close_count;
        state.ext.total_close_count += 1;
        index
    }

    fn wait_for_window(&self) {
        let wait_on = if let Some(mut state) = self.try_lock() {
            self.arm_window(&mut state)
        } else {
            // The lock is contended: arm the wait from a meta task instead
            // of queueing this thread behind the other holders.
            let Some(this) = self.self_ref.upgrade() else {
                return;
            };
            let armed = Arc::new(Mutex::new(Event::NONE));
            let slot = Arc::clone(&armed);
            self.runtime()
                .scheduler()
                .issue(
                    Priority::Latency,
                    Event::NONE,
                    Box::new(move || {
                        let event = {
                            let mut state = this.lock();
                            this.arm_window(&mut state)
                        };
                        *slot.lock() = event;
                    }),
                )
                .wait();
            let event = armed.lock().clone();
            event
        };
        if !wait_on.has_triggered() {
            debug!(ctx = %self.uid(), outstanding = self.outstanding_children(), "window full, waiting");
            wait_on.wait();
        }
    }

    fn arm_window(&self, state: &mut ContextState<InnerState>) -> Event {
        if self.outstanding_children() < state.ext.config.max_window_size {
            return Event::NONE;
        }
        state.ext.window_wait.get_or_insert_with(UserEvent::new).event()
    }

    /// Drops one outstanding child; returns the window waiter to wake.
    fn release_window(&self, state: &mut ContextState<InnerState>) -> Option<UserEvent> {
        let previous = self
            .outstanding_children
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_else(|n| n);
        debug_assert!(previous > 0, "outstanding child count underflow");
        let remaining = previous.saturating_sub(1);
        let config = state.ext.config;
        if state.ext.window_wait.is_some()
            && config.max_window_size > 0
            && remaining <= config.hysteresis_threshold()
        {
            state.ext.window_wait.take()
        } else {
            None
        }
    }

    /// Queues `op` for logical dependence analysis after every earlier
    /// child and after `precondition`.
    ///
    /// Tracking children enter the executing set. The returned event
    /// triggers once the analysis ran.
    pub fn add_to_dependence_queue(&self, op: Arc<dyn Operation>, precondition: Event) -> Event {
        let uid = op.unique_id();
        let (after, done, priority) = {
            let mut state = self.lock();
            if op.is_tracking_parent() {
                debug_assert!(
                    !state.ext.executing_children.contains_key(&uid)
                        && !state.ext.executed_children.contains_key(&uid)
                        && !state.ext.complete_children.contains(&uid),
                    "child {uid} registered twice"
                );
                state.ext.executing_children.insert(uid, Arc::clone(&op));
            }
            let after = Event::merge([precondition, state.ext.dependence_tail.clone()]);
            let done = UserEvent::new();
            state.ext.dependence_tail = done.event();
            let priority = if state.ext.gate.active {
                Priority::Throughput
            } else {
                Priority::Deferred
            };
            (after, done, priority)
        };
        trace!(ctx = %self.uid(), op = %uid, ?priority, "dependence analysis queued");
        let analyzed = self.runtime().scheduler().issue(
            priority,
            after,
            Box::new(move || op.execute_dependence_analysis()),
        );
        let chained = done.clone();
        analyzed.on_trigger(move || chained.trigger());
        done.event()
    }

    /// The child finished executing.
    pub fn register_child_executed(&self, op: UniqueId) {
        let wake = {
            let mut state = self.lock();
            let child = state.ext.executing_children.remove(&op);
            debug_assert!(child.is_some(), "child {op} executed but was not executing");
            if let Some(child) = child {
                state.ext.executed_children.insert(op, child);
            }
            self.release_window(&mut state)
        };
        trace!(ctx = %self.uid(), op = %op, "child executed");
        if let Some(wake) = wake {
            debug!(ctx = %self.uid(), "window drained, resuming");
            wake.trigger();
        }
    }

    /// The child completed. Fires the owner's children-complete callback
    /// once the task has executed and no child is still running.
    pub fn register_child_complete(&self, op: UniqueId) {
        let (fire, child) = {
            let mut state = self.lock();
            let child = state.ext.executed_children.remove(&op);
            debug_assert!(child.is_some(), "child {op} completed but was not executed");
            if child.is_some() {
                state.ext.complete_children.insert(op);
            }
            (Self::claim_complete(&mut state), child)
        };
        drop(child);
        trace!(ctx = %self.uid(), op = %op, "child complete");
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_complete();
        }
    }

    /// The child committed. Fires the owner's children-committed callback
    /// once the task has executed and every child set is empty.
    pub fn register_child_commit(&self, op: UniqueId) {
        let fire = {
            let mut state = self.lock();
            let removed = state.ext.complete_children.remove(&op);
            debug_assert!(removed, "child {op} committed but was not complete");
            Self::claim_commit(&mut state)
        };
        trace!(ctx = %self.uid(), op = %op, "child committed");
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_committed();
        }
    }

    /// Forgets a child in any state, for operations that never run.
    pub fn unregister_child_operation(&self, op: UniqueId) {
        let (wake, removed) = {
            let mut state = self.lock();
            let removed = (
                state.ext.executing_children.remove(&op),
                state.ext.executed_children.remove(&op),
            );
            state.ext.complete_children.remove(&op);
            (self.release_window(&mut state), removed)
        };
        drop(removed);
        trace!(ctx = %self.uid(), op = %op, "child unregistered");
        if let Some(wake) = wake {
            wake.trigger();
        }
    }

    fn claim_complete(state: &mut ContextState<InnerState>) -> bool {
        if state.task_executed && state.ext.children_idle() && !state.children_complete_invoked {
            state.children_complete_invoked = true;
            return true;
        }
        false
    }

    fn claim_commit(state: &mut ContextState<InnerState>) -> bool {
        if state.task_executed
            && state.ext.children_idle()
            && state.ext.complete_children.is_empty()
            && !state.children_commit_invoked
        {
            state.children_commit_invoked = true;
            return true;
        }
        false
    }

    /// Fires the children-complete callback if the task executed and no
    /// child is running. Returns true if it fired now.
    pub fn attempt_children_complete(&self) -> bool {
        let fire = Self::claim_complete(&mut self.lock());
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_complete();
        }
        fire
    }

    /// Fires the children-committed callback if the task executed and
    /// every child committed. Returns true if it fired now.
    pub fn attempt_children_commit(&self) -> bool {
        let fire = Self::claim_commit(&mut self.lock());
        if fire && let Some(owner) = self.owner() {
            owner.trigger_children_committed();
        }
        fire
    }

    /// Counts of children per state: executing, executed, complete.
    #[must_use]
    pub fn child_counts(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (
            state.ext.executing_children.len(),
            state.ext.executed_children.len(),
            state.ext.complete_children.len(),
        )
    }

    // ---- task lifecycle ----

    /// Entry of the task body. Returns the task's physical regions.
    pub fn begin_task(&self) -> Vec<PhysicalRegion> {
        self.start_task()
    }

    /// Exit of the task body.
    ///
    /// Fails if a trace is still open. Otherwise inline mappings are
    /// released, every written region gets a close operation (a virtual
    /// close if it was virtually mapped), and [`InnerContext::post_end_task`]
    /// runs.
    pub fn end_task(&self, result: Vec<u8>) -> Result<(), ContextError> {
        if let Some(trace) = self.lock().ext.current_trace {
            let err = ContextError::new(
                ErrorKind::IncompleteTrace,
                format!("task {} finished with trace {trace} still open", self.info()),
            );
            error!(ctx = %self.uid(), %trace, "{err}");
            return Err(err);
        }
        self.unmap_inline_regions();
        let this = self.arc()?;
        let issuer = self.runtime().issuer();
        for (idx, req) in self.regions.iter().enumerate() {
            if !req.privilege.is_write() {
                continue;
            }
            let kind = if self.virtual_mapped[idx] {
                CloseKind::Virtual
            } else {
                CloseKind::Post
            };
            trace!(ctx = %self.uid(), index = idx, ?kind, "issuing close");
            issuer.issue_close(&this, idx, kind);
        }
        self.post_end_task(result);
        Ok(())
    }

    /// Hands `result` to the owner, marks the task executed, unmaps its
    /// regions and fires completion callbacks the child sets allow.
    pub fn post_end_task(&self, result: Vec<u8>) {
        self.finish_task(result, |state| {
            let mapped = state
                .ext
                .executing_children
                .values()
                .chain(state.ext.executed_children.values())
                .map(|op| op.mapped_event())
                .collect();
            ExecutionSummary {
                need_complete: Self::claim_complete(state),
                need_commit: Self::claim_commit(state),
                mapped: Some(mapped),
            }
        });
    }

    /// Runs `child` in this task's thread.
    ///
    /// The child leaves the child sets, regions that conflict with it are
    /// unmapped around its execution and remapped afterwards. A child whose
    /// predicate resolved false is skipped.
    pub fn inline_child_task(&self, child: &Arc<dyn InlineTask>) -> Result<(), ContextError> {
        let this = self.arc()?;
        self.unregister_child_operation(child.unique_id());
        if !child.predicate_value() {
            debug!(ctx = %self.uid(), child = %child.info(), "inline child predicated off");
            return Ok(());
        }
        let snapshot: Vec<(PhysicalRegion, bool)> = {
            let state = self.lock();
            state
                .physical_regions
                .iter()
                .chain(&state.inline_regions)
                .map(|region| (region.clone(), region.is_mapped()))
                .collect()
        };
        for region in self.find_conflicting_regions(&child.regions()) {
            region.unmap();
        }
        trace!(ctx = %self.uid(), child = %child.info(), "inlining child");
        child.perform_inlining();
        let issuer = self.runtime().issuer();
        let mut remapped = Vec::new();
        for (region, was_mapped) in snapshot {
            match (was_mapped, region.is_mapped()) {
                (true, false) => remapped.push(issuer.issue_remap(&this, &region)),
                (false, true) => region.unmap(),
                _ => {}
            }
        }
        Event::merge(remapped).wait();
        Ok(())
    }

    // ---- region tree context ----

    /// Installs the task's requirements in its region-tree context.
    ///
    /// Reduce-only requirements and simultaneous read-only, read-write or
    /// write-discard requirements restrict their fields to the mapped
    /// instances.
    pub fn initialize_region_tree_contexts(&self) {
        let forest = self.forest();
        let physical = self.physical_regions();
        let mut restricted = Vec::new();
        for (idx, req) in self.regions.iter().enumerate() {
            if req.flags.contains(RequirementFlags::NO_ACCESS) {
                continue;
            }
            if self.virtual_mapped[idx] {
                forest.initialize_context(self.tree_context, req, true);
                continue;
            }
            forest.initialize_context(self.tree_context, req, false);
            let simultaneous = req.coherence == Coherence::Simultaneous
                && (req.privilege == PrivilegeMode::READ_ONLY
                    || req.privilege == PrivilegeMode::READ_WRITE
                    || req.privilege == PrivilegeMode::WRITE_DISCARD);
            if req.privilege.is_reduce() || simultaneous {
                let instances = physical.get(idx).map(PhysicalRegion::instances).unwrap_or_default();
                restricted.push((req.clone(), instances));
            }
        }
        if restricted.is_empty() {
            return;
        }
        let mut state = self.lock();
        for (req, instances) in restricted {
            state.ext.restrictions.add_coherence_restriction(&req, instances);
        }
    }

    /// Drops every piece of region-tree state this context installed.
    ///
    /// Returnable created regions are invalidated in the outermost local
    /// context, keeping their physical state there unless they were deleted
    /// or this is the outermost context. Cached views and the version
    /// owners this process recorded are dropped.
    pub fn invalidate_region_tree_contexts(&self) {
        let forest = self.forest();
        for (idx, req) in self.regions.iter().enumerate() {
            let Some(region) = req.target_region() else {
                continue;
            };
            forest.invalidate_context(self.tree_context, region, false);
            if !self.virtual_mapped[idx] {
                forest.invalidate_versions(self.tree_context, region);
            }
        }
        let (created, owners) = {
            let mut state = self.lock();
            let created: Vec<(RegionRequirement, bool, bool)> = state
                .created_requirements
                .iter()
                .zip(&state.returnable_privileges)
                .map(|(req, &returnable)| {
                    (req.clone(), returnable, state.was_created_requirement_deleted(req))
                })
                .collect();
            state.ext.top_views.clear();
            let owners = std::mem::take(&mut state.ext.version_owners);
            (created, owners)
        };
        if created.iter().any(|(_, returnable, _)| *returnable) {
            let outermost = self.find_outermost_local_context(None);
            for (req, returnable, deleted) in &created {
                let Some(region) = req.target_region() else {
                    continue;
                };
                if !returnable {
                    forest.invalidate_context(self.tree_context, region, false);
                    continue;
                }
                if let Some(outer) = &outermost {
                    let is_outermost = outer.uid() == self.uid();
                    forest.invalidate_context(outer.tree_context, region, !is_outermost && !deleted);
                }
            }
        } else {
            for (req, _, _) in &created {
                if let Some(region) = req.target_region() {
                    forest.invalidate_context(self.tree_context, region, false);
                }
            }
        }
        if owners.values().any(|owner| !owner.remote_only) {
            forest.invalidate_all_versions(self.tree_context);
        }
        debug!(ctx = %self.uid(), created = created.len(), "region tree contexts invalidated");
    }

    /// Makes `fence` a dependence point for every region this context uses.
    ///
    /// Returnable created regions are analyzed in the outermost local
    /// context, the rest in this one.
    pub fn perform_fence_analysis(&self, fence: &dyn Fence) {
        let forest = self.forest();
        let fence_id = fence.unique_id();
        for region in self.regions.iter().filter_map(RegionRequirement::target_region) {
            forest.perform_fence_analysis(self.tree_context, fence_id, region);
        }
        let (local, outermost): (Vec<_>, Vec<_>) = {
            let state = self.lock();
            state
                .created_requirements
                .iter()
                .zip(&state.returnable_privileges)
                .filter_map(|(req, &returnable)| req.target_region().map(|r| (r, returnable)))
                .partition(|(_, returnable)| !returnable)
        };
        for (region, _) in local {
            forest.perform_fence_analysis(self.tree_context, fence_id, region);
        }
        if outermost.is_empty() {
            return;
        }
        let ctx = self
            .find_outermost_local_context(None)
            .map_or(self.tree_context, |outer| outer.tree_context);
        for (region, _) in outermost {
            forest.perform_fence_analysis(ctx, fence_id, region);
        }
    }

    /// Sends the logical state of every live returnable created region to
    /// the parent context on `target`.
    pub fn send_back_created_state(&self, target: AddressSpace) -> Result<(), ContextError> {
        let parent = self.find_parent_context().ok_or_else(|| {
            ContextError::new(
                ErrorKind::MissingContext,
                format!("task {} has no parent to return created state to", self.info()),
            )
        })?;
        let returnable: Vec<RegionRequirement> = {
            let state = self.lock();
            state
                .created_requirements
                .iter()
                .zip(&state.returnable_privileges)
                .filter(|(req, returnable)| **returnable && !state.was_created_requirement_deleted(req))
                .map(|(req, _)| req.clone())
                .collect()
        };
        let parent_uid = parent.context_uid();
        for req in &returnable {
            self.forest()
                .send_back_logical_state(self.tree_context, parent_uid, req, target);
        }
        debug!(ctx = %self.uid(), count = returnable.len(), %target, "created state sent back");
        Ok(())
    }

    // ---- restrictions ----

    /// An acquire lifts the coherence restriction on `req`'s fields.
    pub fn add_acquisition(&self, op: UniqueId, req: &RegionRequirement) -> Result<(), ContextError> {
        let acquired = self
            .lock()
            .ext
            .restrictions
            .add_acquisition(self.forest(), op, req);
        if acquired {
            return Ok(());
        }
        let err = ContextError::new(
            ErrorKind::UnrestrictedAcquire,
            format!(
                "illegal acquire operation (ID {op}) performed in task {}: acquire was performed on a non-restricted region",
                self.info()
            ),
        );
        error!(ctx = %self.uid(), op = %op, "{err}");
        Err(err)
    }

    /// A release ends an earlier acquire on `req`.
    pub fn remove_acquisition(&self, op: UniqueId, req: &RegionRequirement) -> Result<(), ContextError> {
        if self.lock().ext.restrictions.remove_acquisition(req) {
            return Ok(());
        }
        let err = ContextError::new(
            ErrorKind::UnacquiredRelease,
            format!(
                "illegal release operation (ID {op}) performed in task {}: release was performed on a region that had not previously been acquired",
                self.info()
            ),
        );
        error!(ctx = %self.uid(), op = %op, "{err}");
        Err(err)
    }

    /// An attach restricts `req`'s fields to `instance`.
    pub fn add_restriction(&self, op: UniqueId, instance: ManagerId, req: &RegionRequirement) {
        self.lock().ext.restrictions.add_restriction(op, instance, req);
    }

    /// A detach removes the restriction an attach put on `req`.
    pub fn remove_restriction(&self, op: UniqueId, req: &RegionRequirement) -> Result<(), ContextError> {
        if self.lock().ext.restrictions.remove_restriction(req) {
            return Ok(());
        }
        let err = ContextError::new(
            ErrorKind::UnattachedDetach,
            format!(
                "illegal detach operation (ID {op}) performed in task {}: detach was performed on a region that had not previously been attached",
                self.info()
            ),
        );
        error!(ctx = %self.uid(), op = %op, "{err}");
        Err(err)
    }

    /// Drops every restriction.
    pub fn release_restrictions(&self) {
        self.lock().ext.restrictions.clear();
    }

    /// True if any coherence restriction is in place.
    #[must_use]
    pub fn has_restrictions(&self) -> bool {
        !self.lock().ext.restrictions.is_empty()
    }

    /// Which of `req`'s fields are restricted, and to which instances.
    #[must_use]
    pub fn perform_restricted_analysis(&self, req: &RegionRequirement) -> RestrictInfo {
        self.lock().ext.restrictions.analyze(self.forest(), req)
    }

    // ---- lookup chain ----

    /// Context that holds the logical state for requirement `index`.
    #[must_use]
    pub fn find_parent_logical_context(&self, index: usize) -> Option<Arc<Self>> {
        if index < self.regions.len() {
            return self.self_ref.upgrade();
        }
        let returnable = self
            .lock()
            .returnable_privileges
            .get(index - self.regions.len())
            .copied()
            .unwrap_or(false);
        if returnable {
            self.find_outermost_local_context(None)
                .or_else(|| self.self_ref.upgrade())
        } else {
            self.self_ref.upgrade()
        }
    }

    /// Context that holds the physical state for requirement `index`.
    ///
    /// Virtually mapped regions live in the parent's physical context;
    /// created regions in the top context.
    #[must_use]
    pub fn find_parent_physical_context(&self, index: usize) -> Option<Arc<Self>> {
        if index < self.regions.len() {
            if !self.virtual_mapped[index] {
                return self.self_ref.upgrade();
            }
            let parent_index = self.parent_req_indexes[index];
            return self
                .find_parent_context()
                .and_then(|parent| parent.find_parent_physical_context(parent_index));
        }
        self.find_top_context()
    }

    /// Outermost context on this process that encloses this one, or
    /// `previous` if the chain leaves the process here.
    #[must_use]
    pub fn find_outermost_local_context(&self, previous: Option<Arc<Self>>) -> Option<Arc<Self>> {
        match &self.variant {
            Variant::Task => {
                let this = self.self_ref.upgrade();
                match self.find_parent_context() {
                    Some(parent) => parent.find_outermost_local_context(this),
                    None => this,
                }
            }
            Variant::TopLevel | Variant::Remote(_) => previous,
        }
    }

    /// The top-level context this context descends from.
    #[must_use]
    pub fn find_top_context(&self) -> Option<Arc<Self>> {
        match &self.variant {
            Variant::TopLevel => self.self_ref.upgrade(),
            Variant::Remote(info) if info.top_level => self.self_ref.upgrade(),
            Variant::Task | Variant::Remote(_) => {
                self.find_parent_context().and_then(|parent| parent.find_top_context())
            }
        }
    }

    /// The context the owning task was launched from.
    #[must_use]
    pub fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        match &self.variant {
            Variant::Task => self.owner().and_then(|owner| owner.parent_context()),
            Variant::TopLevel => None,
            Variant::Remote(info) => self
                .remote_parent(info)
                .map(|parent| parent as Arc<dyn TaskContext>),
        }
    }

    /// Local fields of this context and every context enclosing it.
    pub fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        if matches!(self.variant, Variant::Task)
            && let Some(parent) = self.find_parent_context()
        {
            parent.find_enclosing_local_fields(out);
        }
        out.extend(self.local_fields());
    }
}

impl fmt::Debug for InnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerContext")
            .field("uid", &self.uid())
            .field("kind", &self.context_kind())
            .field("task", &self.info().name)
            .finish_non_exhaustive()
    }
}

impl Drop for InnerContext {
    fn drop(&mut self) {
        let uid = self.uid();
        match &self.variant {
            Variant::Remote(info) => info.free_local_fields(self.forest()),
            Variant::Task | Variant::TopLevel => {
                self.runtime().unregister_context(uid);
                let remotes = std::mem::take(&mut self.core.lock().ext.remote_instances);
                for space in remotes {
                    if let Err(err) = self
                        .runtime()
                        .send(space, &Message::RemoteContextFree { context: uid })
                    {
                        warn!(ctx = %uid, %space, error = %err, "failed to free remote mirror");
                    }
                }
            }
        }
        self.forest().free_context(self.tree_context);
        trace!(ctx = %uid, "context dropped");
    }
}

impl TaskContext for InnerContext {
    fn kind(&self) -> ContextKind {
        self.context_kind()
    }

    fn context_uid(&self) -> UniqueId {
        self.uid()
    }

    fn task_info(&self) -> &TaskInfo {
        self.info()
    }

    fn runtime(&self) -> &Arc<ContextRuntime> {
        self.core.runtime()
    }

    fn as_inner(&self) -> Option<Arc<InnerContext>> {
        self.self_ref.upgrade()
    }

    fn find_parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        Self::find_parent_context(self)
    }

    fn find_outermost_local_context(&self, previous: Option<Arc<InnerContext>>) -> Option<Arc<InnerContext>> {
        Self::find_outermost_local_context(self, previous)
    }

    fn find_top_context(&self) -> Option<Arc<InnerContext>> {
        Self::find_top_context(self)
    }

    fn find_parent_logical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        Self::find_parent_logical_context(self, index)
    }

    fn find_parent_physical_context(&self, index: usize) -> Option<Arc<InnerContext>> {
        Self::find_parent_physical_context(self, index)
    }

    fn get_version_owner(&self, node: RegionTreeNode, source: AddressSpace) -> Result<AddressSpace, ContextError> {
        Self::get_version_owner(self, node, source)
    }

    fn find_enclosing_local_fields(&self, out: &mut Vec<LocalFieldInfo>) {
        Self::find_enclosing_local_fields(self, out);
    }

    fn pack_remote_context(&self, target: AddressSpace) -> Result<RemoteContextPayload, ContextError> {
        Self::pack_remote_context(self, target)
    }

    fn register_new_child_operation(&self, op: &Arc<dyn Operation>) -> Result<usize, ContextError> {
        Ok(Self::register_new_child_operation(self, op))
    }

    fn add_to_dependence_queue(&self, op: Arc<dyn Operation>, precondition: Event) -> Result<Event, ContextError> {
        Ok(Self::add_to_dependence_queue(self, op, precondition))
    }

    fn register_child_executed(&self, op: UniqueId) {
        Self::register_child_executed(self, op);
    }

    fn register_child_complete(&self, op: UniqueId) {
        Self::register_child_complete(self, op);
    }

    fn register_child_commit(&self, op: UniqueId) {
        Self::register_child_commit(self, op);
    }

    fn unregister_child_operation(&self, op: UniqueId) {
        Self::unregister_child_operation(self, op);
    }

    fn register_fence_dependence(&self, op: &dyn Operation) {
        Self::register_fence_dependence(self, op);
    }

    fn increment_pending(&self) {
        Self::increment_pending(self);
    }

    fn decrement_pending(&self) -> Event {
        Self::decrement_pending(self)
    }

    fn find_parent_region(&self, req: &RegionRequirement) -> Result<usize, ContextError> {
        self.core.find_parent_region(req)
    }

    fn num_regions(&self) -> usize {
        self.regions.len()
    }

    fn clone_requirement(&self, index: usize) -> Option<RegionRequirement> {
        self.core.clone_requirement(index)
    }

    fn get_physical_region(&self, index: usize) -> Option<PhysicalRegion> {
        self.core.get_physical_region(index)
    }

    fn physical_regions(&self) -> Vec<PhysicalRegion> {
        self.core.physical_regions()
    }

    fn begin_task(&self) -> Vec<PhysicalRegion> {
        Self::begin_task(self)
    }

    fn end_task(&self, result: Vec<u8>) -> Result<(), ContextError> {
        Self::end_task(self, result)
    }

    fn post_end_task(&self, result: Vec<u8>) {
        Self::post_end_task(self, result);
    }

    fn attempt_children_complete(&self) -> bool {
        Self::attempt_children_complete(self)
    }

    fn attempt_children_commit(&self) -> bool {
        Self::attempt_children_commit(self)
    }

    fn inline_child_task(&self, child: &Arc<dyn InlineTask>) -> Result<(), ContextError> {
        Self::inline_child_task(self, child)
    }
}
