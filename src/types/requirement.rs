//! Region and index-space requirements.

use super::id::{
    FieldId, FieldSpace, IndexSpace, LogicalPartition, LogicalRegion,
    ReductionOpId, RegionTreeId,
};
use super::privilege::{Coherence, PrivilegeMode, RegionUsage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of handle a region requirement names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    /// A single region.
    Singular,
    /// A region used as the upper bound of a projection.
    RegionProjection,
    /// A partition used as the upper bound of a projection.
    PartitionProjection,
}

/// The region-tree handle a requirement names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionHandle {
    /// A single region.
    Singular(LogicalRegion),
    /// Projection rooted at a region.
    RegionProjection(LogicalRegion),
    /// Projection rooted at a partition.
    PartitionProjection(LogicalPartition),
}

impl RegionHandle {
    /// Returns the handle type.
    #[must_use]
    pub const fn handle_type(&self) -> HandleType {
        match self {
            Self::Singular(_) => HandleType::Singular,
            Self::RegionProjection(_) => HandleType::RegionProjection,
            Self::PartitionProjection(_) => HandleType::PartitionProjection,
        }
    }

    /// Returns the region, unless the handle is a partition.
    #[must_use]
    pub const fn region(&self) -> Option<LogicalRegion> {
        match self {
            Self::Singular(r) | Self::RegionProjection(r) => Some(*r),
            Self::PartitionProjection(_) => None,
        }
    }

    /// Returns the partition, if the handle is one.
    #[must_use]
    pub const fn partition(&self) -> Option<LogicalPartition> {
        match self {
            Self::PartitionProjection(p) => Some(*p),
            _ => None,
        }
    }

    /// Tree of the handle.
    #[must_use]
    pub const fn tree(&self) -> RegionTreeId {
        match self {
            Self::Singular(r) | Self::RegionProjection(r) => r.tree,
            Self::PartitionProjection(p) => p.tree,
        }
    }

    /// Field space of the handle.
    #[must_use]
    pub const fn field_space(&self) -> FieldSpace {
        match self {
            Self::Singular(r) | Self::RegionProjection(r) => r.field_space,
            Self::PartitionProjection(p) => p.field_space,
        }
    }
}

/// Flags attached to a region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RequirementFlags(u32);

impl RequirementFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Privileges were already checked; skip checking them again.
    pub const VERIFIED: Self = Self(0x1);
    /// The requirement should not be mapped.
    pub const NO_ACCESS: Self = Self(0x2);

    /// True if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns the union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A task's declared use of a region: what, how and on which fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRequirement {
    /// Region or partition accessed.
    pub handle: RegionHandle,
    /// Region in the enclosing context this requirement derives from.
    pub parent: LogicalRegion,
    /// Access privilege.
    pub privilege: PrivilegeMode,
    /// Coherence mode.
    pub coherence: Coherence,
    /// Reduction operator for reduce privilege.
    pub redop: ReductionOpId,
    /// Fields accessed.
    pub privilege_fields: BTreeSet<FieldId>,
    /// Requirement flags.
    pub flags: RequirementFlags,
}

impl RegionRequirement {
    /// A singular requirement on `region` derived from `parent`.
    #[must_use]
    pub fn region(
        region: LogicalRegion,
        privilege: PrivilegeMode,
        coherence: Coherence,
        parent: LogicalRegion,
    ) -> Self {
        Self {
            handle: RegionHandle::Singular(region),
            parent,
            privilege,
            coherence,
            redop: 0,
            privilege_fields: BTreeSet::new(),
            flags: RequirementFlags::NONE,
        }
    }

    /// A projection requirement on `partition` derived from `parent`.
    #[must_use]
    pub fn partition(
        partition: LogicalPartition,
        privilege: PrivilegeMode,
        coherence: Coherence,
        parent: LogicalRegion,
    ) -> Self {
        Self {
            handle: RegionHandle::PartitionProjection(partition),
            parent,
            privilege,
            coherence,
            redop: 0,
            privilege_fields: BTreeSet::new(),
            flags: RequirementFlags::NONE,
        }
    }

    /// A reduction requirement on `region` with operator `redop`.
    #[must_use]
    pub fn reduction(
        region: LogicalRegion,
        redop: ReductionOpId,
        coherence: Coherence,
        parent: LogicalRegion,
    ) -> Self {
        let mut req = Self::region(region, PrivilegeMode::REDUCE, coherence, parent);
        req.redop = redop;
        req
    }

    /// Builder-style field list.
    #[must_use]
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldId>) -> Self {
        self.privilege_fields.extend(fields);
        self
    }

    /// Builder-style flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: RequirementFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    /// Handle type.
    #[must_use]
    pub const fn handle_type(&self) -> HandleType {
        self.handle.handle_type()
    }

    /// The region named, if the requirement is not a partition projection.
    #[must_use]
    pub const fn target_region(&self) -> Option<LogicalRegion> {
        self.handle.region()
    }

    /// Usage relation inputs for this requirement.
    #[must_use]
    pub const fn usage(&self) -> RegionUsage {
        RegionUsage::new(self.privilege, self.coherence, self.redop)
    }

    /// True if the requirement names a region (singular or projection).
    #[must_use]
    pub const fn is_region_handle(&self) -> bool {
        !matches!(self.handle, RegionHandle::PartitionProjection(_))
    }
}

/// Allocation privilege on an index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AllocateMode(u32);

impl AllocateMode {
    /// No allocation.
    pub const NO_MEMORY: Self = Self(0x0);
    /// Allocate new points.
    pub const ALLOCABLE: Self = Self(0x1);
    /// Free existing points.
    pub const FREEABLE: Self = Self(0x2);
    /// Both.
    pub const MUTABLE: Self = Self(0x3);

    /// True if `self` asks for a right `parent` does not hold.
    #[must_use]
    pub const fn exceeds(self, parent: Self) -> bool {
        (self.0 & !parent.0) != 0
    }
}

/// A task's declared use of an index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpaceRequirement {
    /// Index space accessed.
    pub handle: IndexSpace,
    /// Allocation privilege.
    pub privilege: AllocateMode,
    /// Index space in the enclosing context this derives from.
    pub parent: IndexSpace,
    /// Privileges already checked.
    pub verified: bool,
}

impl IndexSpaceRequirement {
    /// Creates an unverified index space requirement.
    #[must_use]
    pub const fn new(handle: IndexSpace, privilege: AllocateMode, parent: IndexSpace) -> Self {
        Self {
            handle,
            privilege,
            parent,
            verified: false,
        }
    }
}
