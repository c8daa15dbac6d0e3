//! Test utilities for taskctx.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - [`MemoryForest`], an in-memory region forest that records every call
//! - Recording collaborators: owner tasks, child operations, fences, inline
//!   tasks, the operation issuer and a fixed-configuration mapper
//! - [`LoopbackNetwork`], a transport that delivers between runtimes in one
//!   process
//! - Runtime constructors wired to the recording collaborators
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use taskctx::config::RuntimeConfig;
//! use taskctx::test_utils::{MemoryForest, harness, init_test_logging};
//!
//! init_test_logging();
//! let forest = Arc::new(MemoryForest::new());
//! let h = harness(RuntimeConfig::default(), Arc::clone(&forest));
//! let region = forest.new_tree(1);
//! assert_eq!(h.runtime.forest().tree_root(region.tree), region);
//! ```

use crate::config::{ContextConfiguration, RuntimeConfig};
use crate::context::{InnerContext, TaskContext};
use crate::forest::{RegionForest, ResourceName};
use crate::operation::{CloseKind, Fence, InlineTask, Mapper, OpIssuer, Operation, OwnerTask, TaskInfo};
use crate::physical::PhysicalRegion;
use crate::registry::{ContextRuntime, Transport};
use crate::runtime::{InlineScheduler, MetaScheduler};
use crate::sync::{Event, UserEvent};
use crate::tracing_compat::{trace, warn};
use crate::types::{
    AddressSpace, FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalPartition, LogicalRegion,
    ManagerId, RegionRequirement, RegionTreeContext, RegionTreeId, RegionTreeNode, SerdezId, TraceId,
    UniqueId, ViewId,
};
use crate::util::DetHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

// ============================================================================
// Region forest
// ============================================================================

#[derive(Default)]
struct ForestState {
    next_tree: u32,
    next_space: u32,
    next_partition: u32,
    next_context: u32,
    next_view: u64,
    roots: DetHashMap<RegionTreeId, LogicalRegion>,
    /// Index space id to the id of the space it was carved from.
    space_parents: DetHashMap<u32, u32>,
    /// Index partition id to the id of the space it partitions.
    partition_parents: DetHashMap<u32, u32>,
    node_owners: DetHashMap<RegionTreeNode, AddressSpace>,
    manager_owners: DetHashMap<ManagerId, AddressSpace>,
    fields: BTreeSet<(FieldSpace, FieldId)>,
    finalized: Vec<ResourceName>,
    freed_contexts: Vec<RegionTreeContext>,
    initialized: DetHashMap<RegionTreeContext, Vec<RegionRequirement>>,
    invalidated: DetHashMap<RegionTreeContext, Vec<(LogicalRegion, bool)>>,
    versions_invalidated: Vec<(RegionTreeContext, LogicalRegion)>,
    all_versions_invalidated: Vec<RegionTreeContext>,
    fence_analyses: Vec<(RegionTreeContext, UniqueId, LogicalRegion)>,
    sent_back: Vec<RegionRequirement>,
    views_built: DetHashMap<ManagerId, usize>,
}

impl ForestState {
    fn descends(&self, ancestor: u32, mut space: u32) -> bool {
        loop {
            if space == ancestor {
                return true;
            }
            match self.space_parents.get(&space) {
                Some(&parent) => space = parent,
                None => return false,
            }
        }
    }

    fn overlap(&self, a: u32, b: u32) -> bool {
        self.descends(a, b) || self.descends(b, a)
    }
}

/// In-memory region forest.
///
/// Trees are built with [`MemoryForest::new_tree`],
/// [`MemoryForest::new_subregion`] and [`MemoryForest::new_partition`].
/// Two index spaces are disjoint iff they live in different trees or
/// neither descends from the other. Every node and manager is owned by
/// address space 0 unless set otherwise. Physical-state calls are recorded
/// for inspection.
#[derive(Default)]
pub struct MemoryForest {
    state: Mutex<ForestState>,
}

impl MemoryForest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new region tree whose root uses field space `fs`.
    pub fn new_tree(&self, fs: u32) -> LogicalRegion {
        let mut state = self.state.lock();
        state.next_tree += 1;
        state.next_space += 1;
        let tree = RegionTreeId(state.next_tree);
        let root = LogicalRegion::new(tree, IndexSpace::new(state.next_space, tree.0), FieldSpace::new(fs));
        state.roots.insert(tree, root);
        root
    }

    /// Carves a fresh subregion out of `parent`.
    pub fn new_subregion(&self, parent: LogicalRegion) -> LogicalRegion {
        let mut state = self.state.lock();
        state.next_space += 1;
        let id = state.next_space;
        state.space_parents.insert(id, parent.index_space.id);
        LogicalRegion::new(parent.tree, IndexSpace::new(id, parent.tree.0), parent.field_space)
    }

    /// Creates a partition of `region`.
    pub fn new_partition(&self, region: LogicalRegion) -> LogicalPartition {
        let mut state = self.state.lock();
        state.next_partition += 1;
        let id = state.next_partition;
        state.partition_parents.insert(id, region.index_space.id);
        LogicalPartition::new(region.tree, IndexPartition::new(id, region.tree.0), region.field_space)
    }

    /// Makes `space` the owner of `node`.
    pub fn set_node_owner(&self, node: RegionTreeNode, space: AddressSpace) {
        self.state.lock().node_owners.insert(node, space);
    }

    /// Makes `space` the owner of `manager`.
    pub fn set_manager_owner(&self, manager: ManagerId, space: AddressSpace) {
        self.state.lock().manager_owners.insert(manager, space);
    }

    /// True if the field is currently allocated.
    #[must_use]
    pub fn is_field_allocated(&self, space: FieldSpace, fid: FieldId) -> bool {
        self.state.lock().fields.contains(&(space, fid))
    }

    /// Finalized deletions in order.
    #[must_use]
    pub fn finalized(&self) -> Vec<ResourceName> {
        self.state.lock().finalized.clone()
    }

    /// Region-tree contexts released so far.
    #[must_use]
    pub fn freed_contexts(&self) -> Vec<RegionTreeContext> {
        self.state.lock().freed_contexts.clone()
    }

    /// Requirements installed in `ctx`.
    #[must_use]
    pub fn initialized(&self, ctx: RegionTreeContext) -> Vec<RegionRequirement> {
        self.state.lock().initialized.get(&ctx).cloned().unwrap_or_default()
    }

    /// Regions invalidated in `ctx`, with the users-only flag.
    #[must_use]
    pub fn invalidated(&self, ctx: RegionTreeContext) -> Vec<(LogicalRegion, bool)> {
        self.state.lock().invalidated.get(&ctx).cloned().unwrap_or_default()
    }

    /// Per-region version invalidations.
    #[must_use]
    pub fn versions_invalidated(&self) -> Vec<(RegionTreeContext, LogicalRegion)> {
        self.state.lock().versions_invalidated.clone()
    }

    /// Contexts whose entire version state was dropped.
    #[must_use]
    pub fn all_versions_invalidated(&self) -> Vec<RegionTreeContext> {
        self.state.lock().all_versions_invalidated.clone()
    }

    /// Fence analyses in call order.
    #[must_use]
    pub fn fence_analyses(&self) -> Vec<(RegionTreeContext, UniqueId, LogicalRegion)> {
        self.state.lock().fence_analyses.clone()
    }

    /// Created requirements whose logical state was sent back.
    #[must_use]
    pub fn sent_back(&self) -> Vec<RegionRequirement> {
        self.state.lock().sent_back.clone()
    }

    /// How often a view of `manager` was built.
    #[must_use]
    pub fn views_built(&self, manager: ManagerId) -> usize {
        self.state.lock().views_built.get(&manager).copied().unwrap_or(0)
    }
}

impl RegionForest for MemoryForest {
    fn compute_index_path(&self, parent: IndexSpace, child: IndexSpace) -> bool {
        parent.tid == child.tid && self.state.lock().descends(parent.id, child.id)
    }

    fn compute_partition_path(&self, parent: IndexSpace, child: IndexPartition) -> bool {
        let state = self.state.lock();
        parent.tid == child.tid
            && state
                .partition_parents
                .get(&child.id)
                .is_some_and(|&space| state.descends(parent.id, space))
    }

    fn are_disjoint(&self, a: IndexSpace, b: IndexSpace) -> bool {
        a.tid != b.tid || !self.state.lock().overlap(a.id, b.id)
    }

    fn are_disjoint_partition(&self, space: IndexSpace, partition: IndexPartition) -> bool {
        if space.tid != partition.tid {
            return true;
        }
        let state = self.state.lock();
        state
            .partition_parents
            .get(&partition.id)
            .is_none_or(|&parent| !state.overlap(space.id, parent))
    }

    fn tree_root(&self, tree: RegionTreeId) -> LogicalRegion {
        self.state.lock().roots.get(&tree).copied().unwrap_or_default()
    }

    fn node_owner(&self, node: RegionTreeNode) -> AddressSpace {
        self.state.lock().node_owners.get(&node).copied().unwrap_or(AddressSpace::new(0))
    }

    fn manager_owner(&self, manager: ManagerId) -> AddressSpace {
        self.state.lock().manager_owners.get(&manager).copied().unwrap_or(AddressSpace::new(0))
    }

    fn allocate_field(&self, space: FieldSpace, field: FieldId, _size: usize, _serdez: SerdezId, _local: bool) -> bool {
        let fresh = self.state.lock().fields.insert((space, field));
        trace!(%space, field, fresh, "field allocation");
        fresh
    }

    fn free_field(&self, space: FieldSpace, field: FieldId) {
        self.state.lock().fields.remove(&(space, field));
    }

    fn finalize_deletion(&self, name: ResourceName) {
        self.state.lock().finalized.push(name);
    }

    fn allocate_context(&self) -> RegionTreeContext {
        let mut state = self.state.lock();
        state.next_context += 1;
        RegionTreeContext(state.next_context)
    }

    fn free_context(&self, ctx: RegionTreeContext) {
        self.state.lock().freed_contexts.push(ctx);
    }

    fn initialize_context(&self, ctx: RegionTreeContext, req: &RegionRequirement, _virtual_mapped: bool) {
        self.state.lock().initialized.entry(ctx).or_default().push(req.clone());
    }

    fn invalidate_context(&self, ctx: RegionTreeContext, region: LogicalRegion, users_only: bool) {
        self.state
            .lock()
            .invalidated
            .entry(ctx)
            .or_default()
            .push((region, users_only));
    }

    fn invalidate_versions(&self, ctx: RegionTreeContext, region: LogicalRegion) {
        self.state.lock().versions_invalidated.push((ctx, region));
    }

    fn invalidate_all_versions(&self, ctx: RegionTreeContext) {
        self.state.lock().all_versions_invalidated.push(ctx);
    }

    fn perform_fence_analysis(&self, ctx: RegionTreeContext, fence: UniqueId, region: LogicalRegion) {
        self.state.lock().fence_analyses.push((ctx, fence, region));
    }

    fn send_back_logical_state(
        &self,
        _ctx: RegionTreeContext,
        _target_ctx: UniqueId,
        req: &RegionRequirement,
        _target: AddressSpace,
    ) {
        self.state.lock().sent_back.push(req.clone());
    }

    fn create_instance_top_view(&self, manager: ManagerId, _ctx: UniqueId, _source: AddressSpace) -> ViewId {
        let mut state = self.state.lock();
        state.next_view += 1;
        *state.views_built.entry(manager).or_default() += 1;
        trace!(%manager, view = state.next_view, "view built");
        ViewId(state.next_view)
    }
}

// ============================================================================
// Owner tasks
// ============================================================================

/// Owner task that records every callback.
///
/// Keeps a top-level context of its runtime alive as its parent.
pub struct RecordingOwner {
    info: TaskInfo,
    parent: Arc<InnerContext>,
    completion: UserEvent,
    virtual_instances: AtomicBool,
    children_complete: AtomicUsize,
    children_committed: AtomicUsize,
    executions: AtomicUsize,
    post_mapped: AtomicUsize,
    futures: Mutex<Vec<Vec<u8>>>,
}

impl RecordingOwner {
    /// Creates an owner named `name` whose parent is a fresh top-level
    /// context of `runtime`.
    pub fn new(runtime: &Arc<ContextRuntime>, name: &str) -> Arc<Self> {
        let parent = InnerContext::new_top_level(runtime);
        Arc::new(Self {
            info: TaskInfo::new(runtime.next_unique_id(), name, 0),
            parent,
            completion: UserEvent::new(),
            virtual_instances: AtomicBool::new(false),
            children_complete: AtomicUsize::new(0),
            children_committed: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            post_mapped: AtomicUsize::new(0),
            futures: Mutex::new(Vec::new()),
        })
    }

    /// The top-level context this task was launched from.
    #[must_use]
    pub fn parent(&self) -> Arc<InnerContext> {
        Arc::clone(&self.parent)
    }

    /// Declares whether the task owns virtually mapped instances.
    pub fn set_virtual_instances(&self, value: bool) {
        self.virtual_instances.store(value, Ordering::Release);
    }

    /// Triggers the task's completion event.
    pub fn complete(&self) {
        self.completion.trigger();
    }

    /// Number of children-complete callbacks.
    #[must_use]
    pub fn children_complete_calls(&self) -> usize {
        self.children_complete.load(Ordering::Acquire)
    }

    /// Number of children-committed callbacks.
    #[must_use]
    pub fn children_committed_calls(&self) -> usize {
        self.children_committed.load(Ordering::Acquire)
    }

    /// Number of complete-execution callbacks.
    #[must_use]
    pub fn completed_executions(&self) -> usize {
        self.executions.load(Ordering::Acquire)
    }

    /// Number of post-mapped callbacks.
    #[must_use]
    pub fn post_mapped_calls(&self) -> usize {
        self.post_mapped.load(Ordering::Acquire)
    }

    /// Results handed to the future layer.
    #[must_use]
    pub fn futures(&self) -> Vec<Vec<u8>> {
        self.futures.lock().clone()
    }
}

impl OwnerTask for RecordingOwner {
    fn info(&self) -> TaskInfo {
        self.info.clone()
    }

    fn parent_context(&self) -> Option<Arc<dyn TaskContext>> {
        Some(Arc::clone(&self.parent) as Arc<dyn TaskContext>)
    }

    fn completion_event(&self) -> Event {
        self.completion.event()
    }

    fn trigger_children_complete(&self) {
        self.children_complete.fetch_add(1, Ordering::AcqRel);
    }

    fn trigger_children_committed(&self) {
        self.children_committed.fetch_add(1, Ordering::AcqRel);
    }

    fn complete_execution(&self, _precondition: Event) {
        self.executions.fetch_add(1, Ordering::AcqRel);
    }

    fn handle_future(&self, result: Vec<u8>) {
        self.futures.lock().push(result);
    }

    fn handle_post_mapped(&self, _precondition: Event) {
        self.post_mapped.fetch_add(1, Ordering::AcqRel);
    }

    fn pack_version_state(&self, index: usize, full: bool) -> Vec<u8> {
        format!("{}:{index}:{full}", self.info.uid).into_bytes()
    }

    fn has_virtual_instances(&self) -> bool {
        self.virtual_instances.load(Ordering::Acquire)
    }
}

// ============================================================================
// Child operations
// ============================================================================

static ANALYSIS_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Child operation that records its trace, fence dependences and when it
/// was analyzed.
pub struct TestOp {
    uid: UniqueId,
    trace: Mutex<Option<(TraceId, bool)>>,
    fence_dependences: Mutex<Vec<(UniqueId, u64)>>,
    analyzed_at: AtomicU64,
    mapped: UserEvent,
}

impl TestOp {
    /// Creates an operation with id `uid`.
    #[must_use]
    pub fn new(uid: UniqueId) -> Arc<Self> {
        Arc::new(Self {
            uid,
            trace: Mutex::new(None),
            fence_dependences: Mutex::new(Vec::new()),
            analyzed_at: AtomicU64::new(0),
            mapped: UserEvent::new(),
        })
    }

    /// Trace the operation was recorded in, and whether it was capturing.
    #[must_use]
    pub fn trace(&self) -> Option<(TraceId, bool)> {
        *self.trace.lock()
    }

    /// Fence dependences as (fence, generation).
    #[must_use]
    pub fn fence_dependences(&self) -> Vec<(UniqueId, u64)> {
        self.fence_dependences.lock().clone()
    }

    /// True once dependence analysis ran.
    #[must_use]
    pub fn analyzed(&self) -> bool {
        self.analyzed_at.load(Ordering::Acquire) != 0
    }

    /// True if both ran and this one ran first.
    #[must_use]
    pub fn analyzed_before(&self, other: &Self) -> bool {
        let (mine, theirs) = (
            self.analyzed_at.load(Ordering::Acquire),
            other.analyzed_at.load(Ordering::Acquire),
        );
        mine != 0 && theirs != 0 && mine < theirs
    }

    /// Triggers the operation's mapped event.
    pub fn map(&self) {
        self.mapped.trigger();
    }
}

impl Operation for TestOp {
    fn unique_id(&self) -> UniqueId {
        self.uid
    }

    fn set_trace(&self, trace: TraceId, capturing: bool) {
        *self.trace.lock() = Some((trace, capturing));
    }

    fn register_dependence(&self, fence: &dyn Fence, generation: u64) -> bool {
        if fence.generation() != generation {
            return true;
        }
        self.fence_dependences.lock().push((fence.unique_id(), generation));
        false
    }

    fn execute_dependence_analysis(&self) {
        let tick = ANALYSIS_CLOCK.fetch_add(1, Ordering::AcqRel);
        self.analyzed_at.store(tick, Ordering::Release);
    }

    fn mapped_event(&self) -> Event {
        self.mapped.event()
    }
}

/// Fence whose generation advances on [`TestFence::commit`].
pub struct TestFence {
    uid: UniqueId,
    generation: AtomicU64,
    references: AtomicI64,
}

impl TestFence {
    /// Creates a fence with id `uid`.
    #[must_use]
    pub fn new(uid: UniqueId) -> Arc<Self> {
        Arc::new(Self {
            uid,
            generation: AtomicU64::new(0),
            references: AtomicI64::new(0),
        })
    }

    /// Id of the fence.
    #[must_use]
    pub const fn unique_id(&self) -> UniqueId {
        self.uid
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Mapping references taken minus those dropped.
    #[must_use]
    pub fn mapping_references(&self) -> i64 {
        self.references.load(Ordering::Acquire)
    }

    /// Commits the fence, moving it to its next generation.
    pub fn commit(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Operation for TestFence {
    fn unique_id(&self) -> UniqueId {
        self.uid
    }

    fn set_trace(&self, _trace: TraceId, _capturing: bool) {}

    fn register_dependence(&self, fence: &dyn Fence, generation: u64) -> bool {
        fence.generation() != generation
    }

    fn execute_dependence_analysis(&self) {}
}

impl Fence for TestFence {
    fn generation(&self) -> u64 {
        Self::generation(self)
    }

    fn add_mapping_reference(&self, _generation: u64) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    fn remove_mapping_reference(&self, _generation: u64) {
        self.references.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Child task run inline; records what its body returned.
pub struct TestInlineTask {
    info: TaskInfo,
    regions: Vec<RegionRequirement>,
    predicate: AtomicBool,
    inlined: AtomicUsize,
    results: Mutex<Vec<Vec<u8>>>,
}

impl TestInlineTask {
    /// Creates an inline child with the given requirements.
    #[must_use]
    pub fn new(uid: UniqueId, name: &str, regions: Vec<RegionRequirement>) -> Arc<Self> {
        Arc::new(Self {
            info: TaskInfo::new(uid, name, 1),
            regions,
            predicate: AtomicBool::new(true),
            inlined: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
        })
    }

    /// Sets the resolved predicate value.
    pub fn set_predicate(&self, value: bool) {
        self.predicate.store(value, Ordering::Release);
    }

    /// Number of times the body ran.
    #[must_use]
    pub fn inlined(&self) -> usize {
        self.inlined.load(Ordering::Acquire)
    }

    /// Results of the body, in order.
    #[must_use]
    pub fn results(&self) -> Vec<Vec<u8>> {
        self.results.lock().clone()
    }
}

impl Operation for TestInlineTask {
    fn unique_id(&self) -> UniqueId {
        self.info.uid
    }

    fn set_trace(&self, _trace: TraceId, _capturing: bool) {}

    fn register_dependence(&self, fence: &dyn Fence, generation: u64) -> bool {
        fence.generation() != generation
    }

    fn execute_dependence_analysis(&self) {}
}

impl InlineTask for TestInlineTask {
    fn info(&self) -> TaskInfo {
        self.info.clone()
    }

    fn regions(&self) -> Vec<RegionRequirement> {
        self.regions.clone()
    }

    fn predicate_value(&self) -> bool {
        self.predicate.load(Ordering::Acquire)
    }

    fn perform_inlining(&self) {
        self.inlined.fetch_add(1, Ordering::AcqRel);
    }

    fn end_inline_task(&self, result: Vec<u8>) {
        self.results.lock().push(result);
    }
}

// ============================================================================
// Issuer and mapper
// ============================================================================

/// Issuer that records the operations contexts ask for.
#[derive(Default)]
pub struct RecordingIssuer {
    mapping_fences: Mutex<Vec<UniqueId>>,
    captures: Mutex<Vec<(UniqueId, TraceId)>>,
    completes: Mutex<Vec<(UniqueId, TraceId)>>,
    closes: Mutex<Vec<(UniqueId, usize, CloseKind)>>,
    remaps: Mutex<Vec<(UniqueId, RegionRequirement)>>,
}

impl RecordingIssuer {
    /// Creates an issuer with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts that issued a mapping fence.
    #[must_use]
    pub fn mapping_fences(&self) -> Vec<UniqueId> {
        self.mapping_fences.lock().clone()
    }

    /// Trace captures as (context, trace).
    #[must_use]
    pub fn captures(&self) -> Vec<(UniqueId, TraceId)> {
        self.captures.lock().clone()
    }

    /// Trace completions as (context, trace).
    #[must_use]
    pub fn completes(&self) -> Vec<(UniqueId, TraceId)> {
        self.completes.lock().clone()
    }

    /// Close operations as (context, region index, kind).
    #[must_use]
    pub fn closes(&self) -> Vec<(UniqueId, usize, CloseKind)> {
        self.closes.lock().clone()
    }

    /// Remaps as (context, requirement).
    #[must_use]
    pub fn remaps(&self) -> Vec<(UniqueId, RegionRequirement)> {
        self.remaps.lock().clone()
    }
}

impl OpIssuer for RecordingIssuer {
    fn issue_mapping_fence(&self, ctx: &Arc<InnerContext>) {
        self.mapping_fences.lock().push(ctx.uid());
    }

    fn issue_trace_capture(&self, ctx: &Arc<InnerContext>, trace: TraceId) {
        self.captures.lock().push((ctx.uid(), trace));
    }

    fn issue_trace_complete(&self, ctx: &Arc<InnerContext>, trace: TraceId) {
        self.completes.lock().push((ctx.uid(), trace));
    }

    fn issue_close(&self, ctx: &Arc<InnerContext>, index: usize, kind: CloseKind) {
        self.closes.lock().push((ctx.uid(), index, kind));
    }

    fn issue_remap(&self, ctx: &Arc<InnerContext>, region: &PhysicalRegion) -> Event {
        self.remaps.lock().push((ctx.uid(), region.requirement().clone()));
        region.remap();
        Event::NONE
    }
}

type Configure = dyn Fn(&mut ContextConfiguration) + Send + Sync;

/// Mapper that applies a fixed adjustment to every context.
pub struct FixedMapper {
    name: String,
    configure: Box<Configure>,
}

impl FixedMapper {
    /// Creates a mapper named `name`.
    pub fn new(name: &str, configure: impl Fn(&mut ContextConfiguration) + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_owned(),
            configure: Box::new(configure),
        }
    }
}

impl Mapper for FixedMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_context(&self, _task: &TaskInfo, config: &mut ContextConfiguration) {
        (self.configure)(config);
    }
}

// ============================================================================
// Transport
// ============================================================================

/// In-process network: every joined runtime can reach every other one.
///
/// Delivery is synchronous on the sending thread, so messages between one
/// pair of runtimes arrive in send order.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<DetHashMap<AddressSpace, Weak<ContextRuntime>>>,
    delivered: AtomicUsize,
}

impl LoopbackNetwork {
    /// Creates a network with no members.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches `runtime` to the network.
    pub fn join(self: &Arc<Self>, runtime: &Arc<ContextRuntime>) {
        let source = runtime.local_space();
        self.nodes.write().insert(source, Arc::downgrade(runtime));
        runtime.attach_transport(Arc::new(Endpoint {
            network: Arc::downgrade(self),
            source,
        }));
    }

    /// Number of messages delivered so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    fn deliver(&self, source: AddressSpace, target: AddressSpace, bytes: &[u8]) {
        let node = self.nodes.read().get(&target).and_then(Weak::upgrade);
        let Some(runtime) = node else {
            warn!(%source, %target, "loopback target is not attached; message dropped");
            return;
        };
        self.delivered.fetch_add(1, Ordering::AcqRel);
        runtime.handle_message(source, bytes);
    }
}

struct Endpoint {
    network: Weak<LoopbackNetwork>,
    source: AddressSpace,
}

impl Transport for Endpoint {
    fn send(&self, target: AddressSpace, bytes: Vec<u8>) {
        if let Some(network) = self.network.upgrade() {
            network.deliver(self.source, target, &bytes);
        }
    }
}

// ============================================================================
// Runtime constructors
// ============================================================================

/// A runtime wired to recording collaborators.
pub struct Harness {
    /// The runtime.
    pub runtime: Arc<ContextRuntime>,
    /// Records the operations contexts issue.
    pub issuer: Arc<RecordingIssuer>,
    /// Runs meta tasks inline and records activations.
    pub scheduler: Arc<InlineScheduler>,
}

/// Builds a runtime over `forest` with an inline scheduler and a recording
/// issuer.
///
/// # Panics
///
/// Panics if `config` is invalid.
#[must_use]
pub fn harness(config: RuntimeConfig, forest: Arc<MemoryForest>) -> Harness {
    let issuer = Arc::new(RecordingIssuer::new());
    let scheduler = Arc::new(InlineScheduler::new());
    let dyn_scheduler: Arc<dyn MetaScheduler> = scheduler.clone();
    let dyn_issuer: Arc<dyn OpIssuer> = issuer.clone();
    let runtime = ContextRuntime::new(config, forest, dyn_scheduler, dyn_issuer).expect("valid test configuration");
    Harness {
        runtime,
        issuer,
        scheduler,
    }
}

/// Runtime over a fresh [`MemoryForest`].
#[must_use]
pub fn harness_runtime(config: RuntimeConfig) -> Arc<ContextRuntime> {
    harness_runtime_with(config, Arc::new(MemoryForest::new()))
}

/// Runtime over `forest`.
#[must_use]
pub fn harness_runtime_with(config: RuntimeConfig, forest: Arc<MemoryForest>) -> Arc<ContextRuntime> {
    harness(config, forest).runtime
}
