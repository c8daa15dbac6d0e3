//! Physical region handles.

use crate::sync::UserEvent;
use crate::types::{ManagerId, RegionRequirement};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct MappingState {
    mapped: bool,
    instances: Vec<ManagerId>,
    unmap_event: Option<UserEvent>,
}

struct PhysicalRegionInner {
    requirement: RegionRequirement,
    virtual_mapped: bool,
    state: Mutex<MappingState>,
}

/// Shared handle to one region a task can access directly.
///
/// Clones refer to the same region; equality is identity. A region is
/// either mapped onto physical instances or unmapped. Virtually mapped
/// regions never hold instances.
#[derive(Clone)]
pub struct PhysicalRegion {
    inner: Arc<PhysicalRegionInner>,
}

impl PhysicalRegion {
    /// A region for `requirement`, mapped onto `instances` if `mapped`.
    #[must_use]
    pub fn new(requirement: RegionRequirement, mapped: bool, virtual_mapped: bool, instances: Vec<ManagerId>) -> Self {
        Self {
            inner: Arc::new(PhysicalRegionInner {
                requirement,
                virtual_mapped,
                state: Mutex::new(MappingState {
                    mapped: mapped && !virtual_mapped,
                    instances: if virtual_mapped { Vec::new() } else { instances },
                    unmap_event: None,
                }),
            }),
        }
    }

    /// An unmapped, non-virtual placeholder.
    #[must_use]
    pub fn unmapped(requirement: RegionRequirement) -> Self {
        Self::new(requirement, false, false, Vec::new())
    }

    /// Requirement the region was created for.
    #[must_use]
    pub fn requirement(&self) -> &RegionRequirement {
        &self.inner.requirement
    }

    /// True if the region was virtually mapped.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.inner.virtual_mapped
    }

    /// True if the region is currently mapped.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.inner.state.lock().mapped
    }

    /// Instances the region is mapped onto.
    #[must_use]
    pub fn instances(&self) -> Vec<ManagerId> {
        self.inner.state.lock().instances.clone()
    }

    /// Maps the region onto `instances`; `unmap_event` triggers at unmap.
    pub fn reset_references(&self, instances: Vec<ManagerId>, unmap_event: Option<UserEvent>) {
        let mut state = self.inner.state.lock();
        state.mapped = true;
        state.instances = instances;
        state.unmap_event = unmap_event;
    }

    /// Marks the region mapped again with its previous instances.
    pub fn remap(&self) {
        self.inner.state.lock().mapped = true;
    }

    /// Unmaps the region and fires its unmap event.
    pub fn unmap(&self) {
        let event = {
            let mut state = self.inner.state.lock();
            if !state.mapped {
                return;
            }
            state.mapped = false;
            state.unmap_event.take()
        };
        if let Some(event) = event {
            event.trigger();
        }
    }
}

impl PartialEq for PhysicalRegion {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PhysicalRegion {}

impl fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PhysicalRegion")
            .field("handle", &self.inner.requirement.handle)
            .field("mapped", &state.mapped)
            .field("virtual", &self.inner.virtual_mapped)
            .field("instances", &state.instances)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coherence, FieldSpace, IndexSpace, LogicalRegion, PrivilegeMode, RegionTreeId};

    fn req() -> RegionRequirement {
        let region = LogicalRegion::new(RegionTreeId(1), IndexSpace::new(1, 1), FieldSpace::new(1));
        RegionRequirement::region(region, PrivilegeMode::READ_WRITE, Coherence::Exclusive, region)
    }

    #[test]
    fn unmap_fires_event_once() {
        let region = PhysicalRegion::new(req(), false, false, Vec::new());
        assert!(!region.is_mapped());
        let done = UserEvent::new();
        region.reset_references(vec![ManagerId(3)], Some(done.clone()));
        assert!(region.is_mapped());
        assert_eq!(region.instances(), vec![ManagerId(3)]);
        region.unmap();
        assert!(done.has_triggered());
        assert!(!region.is_mapped());
        region.unmap();
        region.remap();
        assert!(region.is_mapped());
    }

    #[test]
    fn virtual_regions_hold_no_instances() {
        let region = PhysicalRegion::new(req(), true, true, vec![ManagerId(1)]);
        assert!(region.is_virtual());
        assert!(!region.is_mapped());
        assert!(region.instances().is_empty());
    }

    #[test]
    fn equality_is_identity() {
        let a = PhysicalRegion::unmapped(req());
        let b = PhysicalRegion::unmapped(req());
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
