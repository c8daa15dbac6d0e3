//! Privileges, coherence modes and the pairwise dependence relation.

use super::id::ReductionOpId;
use core::fmt;
use core::ops::{BitAnd, BitOr, Not};
use serde::{Deserialize, Serialize};

/// Access privilege bits held on a region.
///
/// `READ_WRITE` includes the reduce bit, so a read-write parent can hand any
/// access to a child. The discard bit on `WRITE_DISCARD` and `WRITE_ONLY`
/// marks "contents will be overwritten" and is not itself an access right.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrivilegeMode(u32);

impl PrivilegeMode {
    /// No access.
    pub const NO_ACCESS: Self = Self(0x0000_0000);
    /// Read access.
    pub const READ_ONLY: Self = Self(0x0000_0001);
    /// Raw write bit.
    pub const WRITE: Self = Self(0x0000_0002);
    /// Reduction access.
    pub const REDUCE: Self = Self(0x0000_0004);
    /// Read, write and reduce.
    pub const READ_WRITE: Self = Self(0x0000_0007);
    /// Marks the previous contents as dead.
    pub const DISCARD_MASK: Self = Self(0x1000_0000);
    /// Write without reading, previous contents discarded.
    pub const WRITE_ONLY: Self = Self(0x1000_0002);
    /// Read-write with previous contents discarded.
    pub const WRITE_DISCARD: Self = Self(0x1000_0007);

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the access bits with the discard marker stripped.
    #[must_use]
    pub const fn access(self) -> Self {
        Self(self.0 & !Self::DISCARD_MASK.0)
    }

    /// True if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Exactly read-only.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        self.0 == Self::READ_ONLY.0
    }

    /// Exactly reduce-only.
    #[must_use]
    pub const fn is_reduce(self) -> bool {
        self.0 == Self::REDUCE.0
    }

    /// Any form of write access.
    #[must_use]
    pub const fn is_write(self) -> bool {
        (self.0 & Self::WRITE.0) != 0
    }

    /// True if `self` holds a bit `parent` does not, the discard bit
    /// included.
    ///
    /// A `WRITE_DISCARD` parent satisfies every request.
    #[must_use]
    pub const fn exceeds(self, parent: Self) -> bool {
        if parent.0 == Self::WRITE_DISCARD.0 {
            return false;
        }
        (self.0 & !parent.0) != 0
    }
}

impl BitOr for PrivilegeMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for PrivilegeMode {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PrivilegeMode {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for PrivilegeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NO_ACCESS => "NO_ACCESS",
            Self::READ_ONLY => "READ_ONLY",
            Self::REDUCE => "REDUCE",
            Self::READ_WRITE => "READ_WRITE",
            Self::WRITE_ONLY => "WRITE_ONLY",
            Self::WRITE_DISCARD => "WRITE_DISCARD",
            other => return write!(f, "PrivilegeMode({:#x})", other.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for PrivilegeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coherence (concurrency) property of a region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Coherence {
    /// Serial access in program order.
    #[default]
    Exclusive,
    /// Serializable but unordered.
    Atomic,
    /// Concurrent access to the same instance.
    Simultaneous,
    /// No coherence guarantees at all.
    Relaxed,
}

/// Privilege, coherence and reduction operator of one use of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionUsage {
    /// Privilege.
    pub privilege: PrivilegeMode,
    /// Coherence.
    pub coherence: Coherence,
    /// Reduction operator, zero unless `privilege` is reduce.
    pub redop: ReductionOpId,
}

impl RegionUsage {
    /// Creates a usage.
    #[must_use]
    pub const fn new(privilege: PrivilegeMode, coherence: Coherence, redop: ReductionOpId) -> Self {
        Self {
            privilege,
            coherence,
            redop,
        }
    }
}

/// Relation between two uses of overlapping data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependenceType {
    /// The uses commute.
    NoDependence,
    /// Read after write, write after write.
    TrueDependence,
    /// Write after read.
    AntiDependence,
    /// Both uses are atomic.
    AtomicDependence,
    /// The uses may run concurrently on the same instance.
    SimultaneousDependence,
}

impl DependenceType {
    /// True if the relation forces an ordering between the uses.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        !matches!(self, Self::NoDependence | Self::SimultaneousDependence)
    }
}

/// Computes the dependence of a later use `u2` on an earlier use `u1`.
#[must_use]
pub fn check_dependence_type(u1: &RegionUsage, u2: &RegionUsage) -> DependenceType {
    if u1.privilege.is_read_only() && u2.privilege.is_read_only() {
        return DependenceType::NoDependence;
    }
    if u1.privilege.is_reduce() && u2.privilege.is_reduce() {
        return if u1.redop == u2.redop {
            DependenceType::NoDependence
        } else {
            DependenceType::TrueDependence
        };
    }
    // At least one side writes or mixes read with reduce.
    if u1.coherence == Coherence::Exclusive || u2.coherence == Coherence::Exclusive {
        if u1.privilege.is_read_only() {
            return DependenceType::AntiDependence;
        }
        return DependenceType::TrueDependence;
    }
    match (u1.coherence, u2.coherence) {
        (Coherence::Atomic, Coherence::Atomic) => DependenceType::AtomicDependence,
        (Coherence::Atomic, _) | (_, Coherence::Atomic) => DependenceType::TrueDependence,
        _ => DependenceType::SimultaneousDependence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(privilege: PrivilegeMode, coherence: Coherence) -> RegionUsage {
        RegionUsage::new(privilege, coherence, 0)
    }

    #[test]
    fn readers_commute() {
        let ro = usage(PrivilegeMode::READ_ONLY, Coherence::Exclusive);
        assert_eq!(check_dependence_type(&ro, &ro), DependenceType::NoDependence);
    }

    #[test]
    fn same_reduction_commutes() {
        let a = RegionUsage::new(PrivilegeMode::REDUCE, Coherence::Exclusive, 3);
        let b = RegionUsage::new(PrivilegeMode::REDUCE, Coherence::Exclusive, 3);
        let c = RegionUsage::new(PrivilegeMode::REDUCE, Coherence::Exclusive, 4);
        assert_eq!(check_dependence_type(&a, &b), DependenceType::NoDependence);
        assert_eq!(check_dependence_type(&a, &c), DependenceType::TrueDependence);
    }

    #[test]
    fn writer_after_reader_is_anti() {
        let ro = usage(PrivilegeMode::READ_ONLY, Coherence::Exclusive);
        let rw = usage(PrivilegeMode::READ_WRITE, Coherence::Exclusive);
        assert_eq!(check_dependence_type(&ro, &rw), DependenceType::AntiDependence);
        assert_eq!(check_dependence_type(&rw, &ro), DependenceType::TrueDependence);
    }

    #[test]
    fn simultaneous_writers_do_not_conflict() {
        let a = usage(PrivilegeMode::READ_WRITE, Coherence::Simultaneous);
        let b = usage(PrivilegeMode::READ_WRITE, Coherence::Relaxed);
        let dep = check_dependence_type(&a, &b);
        assert_eq!(dep, DependenceType::SimultaneousDependence);
        assert!(!dep.is_conflict());
    }

    #[test]
    fn atomic_pairs() {
        let a = usage(PrivilegeMode::READ_WRITE, Coherence::Atomic);
        let s = usage(PrivilegeMode::READ_WRITE, Coherence::Simultaneous);
        assert_eq!(check_dependence_type(&a, &a), DependenceType::AtomicDependence);
        assert!(check_dependence_type(&a, &s).is_conflict());
    }

    #[test]
    fn privilege_subset_rules() {
        assert!(!PrivilegeMode::READ_ONLY.exceeds(PrivilegeMode::READ_WRITE));
        assert!(PrivilegeMode::READ_WRITE.exceeds(PrivilegeMode::READ_ONLY));
        assert!(PrivilegeMode::WRITE_DISCARD.exceeds(PrivilegeMode::READ_WRITE));
        assert!(PrivilegeMode::WRITE_ONLY.exceeds(PrivilegeMode::READ_WRITE));
        assert!(!PrivilegeMode::WRITE_ONLY.exceeds(PrivilegeMode::WRITE_DISCARD));
        assert!(!PrivilegeMode::READ_WRITE.exceeds(PrivilegeMode::WRITE_DISCARD));
        assert!(PrivilegeMode::REDUCE.exceeds(PrivilegeMode::READ_ONLY));
        assert!(!PrivilegeMode::REDUCE.exceeds(PrivilegeMode::READ_WRITE));
    }
}
