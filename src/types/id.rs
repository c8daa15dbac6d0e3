//! Identifier types for contexts, operations and region-tree names.
//!
//! Region-tree names are plain value types: they carry the ids the region
//! forest assigned and nothing else. Equality and ordering are structural so
//! the names can key deterministic maps.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Field identifier within a field space.
pub type FieldId = u32;

/// Reduction operator identifier. Zero means "no reduction".
pub type ReductionOpId = u32;

/// Custom serializer identifier for a field. Zero means "plain bytes".
pub type SerdezId = u32;

/// A runtime-wide unique identifier for operations, tasks and their contexts.
///
/// Unique ids are handed out by [`ContextRuntime`](crate::registry::ContextRuntime)
/// so that the allocating process can be recovered from the id alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId(u64);

impl UniqueId {
    /// Creates a unique id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({})", self.0)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A process (node) in the distributed runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressSpace(u32);

impl AddressSpace {
    /// Creates an address space id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpace({})", self.0)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identifier of a region tree (one tree per top-level logical region).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RegionTreeId(pub u32);

impl fmt::Display for RegionTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// An index space handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct IndexSpace {
    /// Index space id.
    pub id: u32,
    /// Index tree the space belongs to.
    pub tid: u32,
}

impl IndexSpace {
    /// Creates an index space handle.
    #[must_use]
    pub const fn new(id: u32, tid: u32) -> Self {
        Self { id, tid }
    }
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IS{}", self.id)
    }
}

/// An index partition handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct IndexPartition {
    /// Partition id.
    pub id: u32,
    /// Index tree the partition belongs to.
    pub tid: u32,
}

impl IndexPartition {
    /// Creates an index partition handle.
    #[must_use]
    pub const fn new(id: u32, tid: u32) -> Self {
        Self { id, tid }
    }
}

impl fmt::Display for IndexPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IP{}", self.id)
    }
}

/// A field space handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct FieldSpace {
    /// Field space id.
    pub id: u32,
}

impl FieldSpace {
    /// Creates a field space handle.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl fmt::Display for FieldSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FS{}", self.id)
    }
}

/// A logical region: an index space crossed with a field space in one tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LogicalRegion {
    /// Region tree.
    pub tree: RegionTreeId,
    /// Index space of the region.
    pub index_space: IndexSpace,
    /// Field space of the region.
    pub field_space: FieldSpace,
}

impl LogicalRegion {
    /// Creates a logical region handle.
    #[must_use]
    pub const fn new(tree: RegionTreeId, index_space: IndexSpace, field_space: FieldSpace) -> Self {
        Self {
            tree,
            index_space,
            field_space,
        }
    }
}

impl fmt::Display for LogicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{})",
            self.index_space.id, self.field_space.id, self.tree.0
        )
    }
}

/// A logical partition: an index partition crossed with a field space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LogicalPartition {
    /// Region tree.
    pub tree: RegionTreeId,
    /// Index partition of the partition.
    pub index_partition: IndexPartition,
    /// Field space of the partition.
    pub field_space: FieldSpace,
}

impl LogicalPartition {
    /// Creates a logical partition handle.
    #[must_use]
    pub const fn new(
        tree: RegionTreeId,
        index_partition: IndexPartition,
        field_space: FieldSpace,
    ) -> Self {
        Self {
            tree,
            index_partition,
            field_space,
        }
    }
}

impl fmt::Display for LogicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P({},{},{})",
            self.index_partition.id, self.field_space.id, self.tree.0
        )
    }
}

/// A node of a region tree, used to key version ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegionTreeNode {
    /// A region node.
    Region(LogicalRegion),
    /// A partition node.
    Partition(LogicalPartition),
}

impl RegionTreeNode {
    /// Returns the tree the node belongs to.
    #[must_use]
    pub const fn tree(&self) -> RegionTreeId {
        match self {
            Self::Region(r) => r.tree,
            Self::Partition(p) => p.tree,
        }
    }
}

impl fmt::Display for RegionTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region(r) => write!(f, "{r}"),
            Self::Partition(p) => write!(f, "{p}"),
        }
    }
}

/// Identifier of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub u32);

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace{}", self.0)
    }
}

/// Distributed id of a physical instance manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(pub u64);

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Distributed id of a context-specific instance view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Handle of a region-tree context inside the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionTreeContext(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let region = LogicalRegion::new(RegionTreeId(3), IndexSpace::new(7, 1), FieldSpace::new(2));
        assert_eq!(region.to_string(), "(7,2,3)");
        assert_eq!(UniqueId::new(42).to_string(), "#42");
        assert_eq!(AddressSpace::new(1).to_string(), "n1");
        let node = RegionTreeNode::Region(region);
        assert_eq!(node.tree(), RegionTreeId(3));
    }

    #[test]
    fn names_order_structurally() {
        let a = IndexSpace::new(1, 0);
        let b = IndexSpace::new(2, 0);
        assert!(a < b);
        assert_eq!(a, IndexSpace::new(1, 0));
    }
}
