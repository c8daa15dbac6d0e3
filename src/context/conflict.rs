//! Conflicts between mapped regions and new requirements.
//!
//! Before a child operation maps, the context checks whether any region the
//! task currently holds mapped could race with it. Conflicting regions are
//! unmapped by the caller for the duration of the operation.

use super::core::ContextCore;
use crate::physical::PhysicalRegion;
use crate::types::{RegionRequirement, check_dependence_type};

/// Outcome of [`ContextCore::has_conflicting_regions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictInfo {
    /// Index of the conflicting physical region, if one of the task's own.
    pub index: Option<usize>,
    /// A physical region of the task conflicts.
    pub parent_conflict: bool,
    /// An inline-mapped region conflicts.
    pub inline_conflict: bool,
}

impl ConflictInfo {
    /// True if anything conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        self.parent_conflict || self.inline_conflict
    }
}

impl<E> ContextCore<E> {
    /// True if `req` could race with `ours`.
    ///
    /// They must share a tree, be connected by a tree path, share a field,
    /// and have a usage relation other than no dependence or simultaneous.
    #[must_use]
    pub fn check_region_dependence(&self, ours: &RegionRequirement, req: &RegionRequirement) -> bool {
        let Some(our_region) = ours.target_region() else {
            return false;
        };
        if our_region.tree != req.handle.tree() {
            return false;
        }
        let forest = self.forest();
        let connected = match (req.handle.region(), req.handle.partition()) {
            (Some(region), _) => {
                forest.compute_index_path(our_region.index_space, region.index_space)
                    || forest.compute_index_path(region.index_space, our_region.index_space)
            }
            (None, Some(partition)) => {
                forest.compute_partition_path(our_region.index_space, partition.index_partition)
            }
            (None, None) => false,
        };
        if !connected || ours.privilege_fields.is_disjoint(&req.privilege_fields) {
            return false;
        }
        check_dependence_type(&ours.usage(), &req.usage()).is_conflict()
    }

    fn mapped_snapshot(&self) -> (Vec<PhysicalRegion>, Vec<PhysicalRegion>) {
        let state = self.lock();
        (state.physical_regions.clone(), state.inline_regions.clone())
    }

    /// Finds the first mapped region that conflicts with `req`: the task's
    /// own physical regions first, then inline-mapped ones.
    #[must_use]
    pub fn has_conflicting_regions(&self, req: &RegionRequirement) -> ConflictInfo {
        let (physical, inline) = self.mapped_snapshot();
        for (idx, region) in physical.iter().enumerate() {
            if region.is_mapped() && self.check_region_dependence(region.requirement(), req) {
                return ConflictInfo {
                    index: Some(idx),
                    parent_conflict: true,
                    inline_conflict: false,
                };
            }
        }
        let inline_conflict = inline
            .iter()
            .any(|region| region.is_mapped() && self.check_region_dependence(region.requirement(), req));
        ConflictInfo {
            index: None,
            parent_conflict: false,
            inline_conflict,
        }
    }

    /// Every mapped region that conflicts with at least one of `reqs`.
    ///
    /// Multi-requirement operations such as copies pass all their source and
    /// destination requirements at once.
    #[must_use]
    pub fn find_conflicting_regions(&self, reqs: &[RegionRequirement]) -> Vec<PhysicalRegion> {
        let (physical, inline) = self.mapped_snapshot();
        physical
            .into_iter()
            .chain(inline)
            .filter(|region| {
                region.is_mapped()
                    && reqs
                        .iter()
                        .any(|req| self.check_region_dependence(region.requirement(), req))
            })
            .collect()
    }
}
