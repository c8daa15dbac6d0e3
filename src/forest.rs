//! The region-tree collaborator.
//!
//! Contexts never inspect region-tree state directly. Every structural
//! question (is there a path, are two spaces disjoint, who owns a node) and
//! every physical-state mutation goes through [`RegionForest`], which the
//! embedding runtime implements and shares across threads.

use crate::types::{
    AddressSpace, FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalPartition,
    LogicalRegion, ManagerId, RegionRequirement, RegionTreeContext, RegionTreeId,
    RegionTreeNode, SerdezId, UniqueId, ViewId,
};
use std::fmt;

/// A name whose deletion the forest finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceName {
    /// A logical region.
    Region(LogicalRegion),
    /// A logical partition.
    Partition(LogicalPartition),
    /// One field of a field space.
    Field(FieldSpace, FieldId),
    /// A field space.
    FieldSpace(FieldSpace),
    /// An index space.
    IndexSpace(IndexSpace),
    /// An index partition.
    IndexPartition(IndexPartition),
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region(r) => write!(f, "region {r}"),
            Self::Partition(p) => write!(f, "partition {p}"),
            Self::Field(fs, fid) => write!(f, "field {fid} of {fs}"),
            Self::FieldSpace(fs) => write!(f, "field space {fs}"),
            Self::IndexSpace(is) => write!(f, "index space {is}"),
            Self::IndexPartition(ip) => write!(f, "index partition {ip}"),
        }
    }
}

/// Structural queries and physical-state operations on the region forest.
///
/// Implementations must be thread-safe; contexts call them without holding
/// their own locks.
pub trait RegionForest: Send + Sync {
    // ---- structure ----

    /// True if `child` is `parent` or a descendant of it.
    fn compute_index_path(&self, parent: IndexSpace, child: IndexSpace) -> bool;

    /// True if `child` is a partition below `parent`.
    fn compute_partition_path(&self, parent: IndexSpace, child: IndexPartition) -> bool;

    /// True if the two index spaces provably share no points.
    fn are_disjoint(&self, a: IndexSpace, b: IndexSpace) -> bool;

    /// True if the index space and the partition provably share no points.
    fn are_disjoint_partition(&self, space: IndexSpace, partition: IndexPartition) -> bool;

    /// Root region of a region tree.
    fn tree_root(&self, tree: RegionTreeId) -> LogicalRegion;

    /// Process that owns a node's metadata.
    fn node_owner(&self, node: RegionTreeNode) -> AddressSpace;

    /// Process that owns a physical instance manager.
    fn manager_owner(&self, manager: ManagerId) -> AddressSpace;

    // ---- fields and deletion ----

    /// Allocates a field. Returns false if the id is taken.
    fn allocate_field(
        &self,
        space: FieldSpace,
        field: FieldId,
        size: usize,
        serdez: SerdezId,
        local: bool,
    ) -> bool;

    /// Releases a field allocated with [`RegionForest::allocate_field`].
    fn free_field(&self, space: FieldSpace, field: FieldId);

    /// Performs a deletion that no other context can observe anymore.
    fn finalize_deletion(&self, name: ResourceName);

    // ---- physical state ----

    /// Allocates a fresh region-tree context.
    fn allocate_context(&self) -> RegionTreeContext;

    /// Releases a region-tree context.
    fn free_context(&self, ctx: RegionTreeContext);

    /// Installs the logical state for one of a task's requirements.
    fn initialize_context(&self, ctx: RegionTreeContext, req: &RegionRequirement, virtual_mapped: bool);

    /// Drops the logical (and optionally physical) state under `region`.
    fn invalidate_context(&self, ctx: RegionTreeContext, region: LogicalRegion, users_only: bool);

    /// Drops version state under `region`.
    fn invalidate_versions(&self, ctx: RegionTreeContext, region: LogicalRegion);

    /// Drops every version state of the context.
    fn invalidate_all_versions(&self, ctx: RegionTreeContext);

    /// Records `fence` as a dependence point for all users of `region`.
    fn perform_fence_analysis(&self, ctx: RegionTreeContext, fence: UniqueId, region: LogicalRegion);

    /// Sends the logical state of a created requirement to `target`.
    fn send_back_logical_state(
        &self,
        ctx: RegionTreeContext,
        target_ctx: UniqueId,
        req: &RegionRequirement,
        target: AddressSpace,
    );

    /// Builds the context-specific view of an instance owned by this process.
    fn create_instance_top_view(&self, manager: ManagerId, ctx: UniqueId, source: AddressSpace) -> ViewId;
}
