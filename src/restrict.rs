//! Coherence restrictions.
//!
//! A restriction pins a region's data to specific physical instances: reads
//! and writes must go to those instances rather than to copies. Restrictions
//! come from attach operations and from simultaneous or reduce-only task
//! requirements. An acquire lifts a restriction for some fields until the
//! matching release.

use crate::forest::RegionForest;
use crate::types::{FieldId, LogicalRegion, ManagerId, RegionRequirement, UniqueId};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Acquisition {
    op: UniqueId,
    region: LogicalRegion,
    fields: BTreeSet<FieldId>,
}

/// One restricted region and the instances it is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restriction {
    region: LogicalRegion,
    fields: BTreeSet<FieldId>,
    instances: Vec<ManagerId>,
    attached_by: Option<UniqueId>,
    acquisitions: Vec<Acquisition>,
}

impl Restriction {
    /// Region the restriction covers.
    #[must_use]
    pub const fn region(&self) -> LogicalRegion {
        self.region
    }

    /// Fields the restriction covers.
    #[must_use]
    pub const fn fields(&self) -> &BTreeSet<FieldId> {
        &self.fields
    }

    /// Attach operation that created the restriction, if any.
    #[must_use]
    pub const fn attached_by(&self) -> Option<UniqueId> {
        self.attached_by
    }

    fn covers(&self, forest: &dyn RegionForest, region: LogicalRegion) -> bool {
        self.region.tree == region.tree
            && forest.compute_index_path(self.region.index_space, region.index_space)
    }

    fn acquired_fields(&self, forest: &dyn RegionForest, region: LogicalRegion) -> BTreeSet<FieldId> {
        self.acquisitions
            .iter()
            .filter(|acq| {
                acq.region.tree == region.tree
                    && forest.compute_index_path(acq.region.index_space, region.index_space)
            })
            .flat_map(|acq| acq.fields.iter().copied())
            .collect()
    }
}

/// Result of restricted analysis for one requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictInfo {
    /// Instances the requirement must use.
    pub instances: Vec<ManagerId>,
    /// Fields that are restricted.
    pub fields: BTreeSet<FieldId>,
}

impl RestrictInfo {
    /// True if any field of the requirement is restricted.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// The restrictions active in one context.
#[derive(Debug, Clone, Default)]
pub struct RestrictionSet {
    restrictions: Vec<Restriction>,
}

impl RestrictionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no restriction is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restrictions.is_empty()
    }

    /// Number of active restrictions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.restrictions.len()
    }

    /// Active restrictions.
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Restriction> {
        self.restrictions.iter()
    }

    /// Restricts a task requirement to the instances it was mapped to.
    pub fn add_coherence_restriction(&mut self, req: &RegionRequirement, instances: Vec<ManagerId>) {
        let Some(region) = req.target_region() else {
            return;
        };
        self.restrictions.push(Restriction {
            region,
            fields: req.privilege_fields.clone(),
            instances,
            attached_by: None,
            acquisitions: Vec::new(),
        });
    }

    /// Lifts the restrictions covering `req` for its fields.
    ///
    /// Returns false if no restriction covers the requirement.
    pub fn add_acquisition(
        &mut self,
        forest: &dyn RegionForest,
        op: UniqueId,
        req: &RegionRequirement,
    ) -> bool {
        let Some(region) = req.target_region() else {
            return false;
        };
        let mut found = false;
        for restriction in &mut self.restrictions {
            if !restriction.covers(forest, region) {
                continue;
            }
            let fields: BTreeSet<FieldId> = restriction
                .fields
                .intersection(&req.privilege_fields)
                .copied()
                .collect();
            if fields.is_empty() {
                continue;
            }
            restriction.acquisitions.push(Acquisition { op, region, fields });
            found = true;
        }
        found
    }

    /// Ends acquisitions on exactly `req`'s region for its fields.
    ///
    /// Returns false if nothing was acquired there.
    pub fn remove_acquisition(&mut self, req: &RegionRequirement) -> bool {
        let Some(region) = req.target_region() else {
            return false;
        };
        let mut found = false;
        for restriction in &mut self.restrictions {
            for acq in &mut restriction.acquisitions {
                if acq.region != region {
                    continue;
                }
                let before = acq.fields.len();
                acq.fields.retain(|fid| !req.privilege_fields.contains(fid));
                found |= acq.fields.len() != before;
            }
            restriction.acquisitions.retain(|acq| !acq.fields.is_empty());
        }
        found
    }

    /// Records an attach of `instance` to `req`'s region.
    pub fn add_restriction(&mut self, op: UniqueId, instance: ManagerId, req: &RegionRequirement) {
        let Some(region) = req.target_region() else {
            return;
        };
        self.restrictions.push(Restriction {
            region,
            fields: req.privilege_fields.clone(),
            instances: vec![instance],
            attached_by: Some(op),
            acquisitions: Vec::new(),
        });
    }

    /// Removes attach restrictions on exactly `req`'s region.
    ///
    /// Returns false if no attach covered it.
    pub fn remove_restriction(&mut self, req: &RegionRequirement) -> bool {
        let Some(region) = req.target_region() else {
            return false;
        };
        let before = self.restrictions.len();
        self.restrictions.retain(|r| {
            !(r.attached_by.is_some()
                && r.region == region
                && !r.fields.is_disjoint(&req.privilege_fields))
        });
        self.restrictions.len() != before
    }

    /// Drops every restriction.
    pub fn clear(&mut self) {
        self.restrictions.clear();
    }

    /// Determines which fields of `req` are restricted and to which instances.
    #[must_use]
    pub fn analyze(&self, forest: &dyn RegionForest, req: &RegionRequirement) -> RestrictInfo {
        let mut info = RestrictInfo::default();
        let Some(region) = req.target_region() else {
            return info;
        };
        for restriction in &self.restrictions {
            if !restriction.covers(forest, region) {
                continue;
            }
            let acquired = restriction.acquired_fields(forest, region);
            let restricted: Vec<FieldId> = restriction
                .fields
                .intersection(&req.privilege_fields)
                .filter(|fid| !acquired.contains(fid))
                .copied()
                .collect();
            if restricted.is_empty() {
                continue;
            }
            info.fields.extend(restricted);
            for instance in &restriction.instances {
                if !info.instances.contains(instance) {
                    info.instances.push(*instance);
                }
            }
        }
        info
    }
}
