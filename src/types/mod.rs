//! Core value types shared by every context variant.
//!
//! - [`id`]: identifiers for contexts, processes and region-tree names
//! - [`privilege`]: privilege bits, coherence modes and the dependence relation
//! - [`requirement`]: region and index-space requirements

pub mod id;
pub mod privilege;
pub mod requirement;

pub use id::{
    AddressSpace, FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalPartition,
    LogicalRegion, ManagerId, ReductionOpId, RegionTreeContext, RegionTreeId, RegionTreeNode,
    SerdezId, TraceId, UniqueId, ViewId,
};
pub use privilege::{
    Coherence, DependenceType, PrivilegeMode, RegionUsage, check_dependence_type,
};
pub use requirement::{
    AllocateMode, HandleType, IndexSpaceRequirement, RegionHandle, RegionRequirement,
    RequirementFlags,
};
