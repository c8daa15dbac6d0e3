//! Privilege checking and parent-requirement resolution.
//!
//! A child requirement is legal if some requirement of this context (static
//! first, then created) names its parent region, reaches its region or
//! partition by a tree path, holds at least its privileges, and covers its
//! fields. Fields the task created itself are always covered.

use super::core::{ContextCore, ContextState};
use crate::error::{ContextError, ErrorKind, PrivilegeError};
use crate::physical::PhysicalRegion;
use crate::types::{
    Coherence, FieldId, HandleType, IndexSpaceRequirement, PrivilegeMode, RegionRequirement,
    RequirementFlags,
};
use std::collections::BTreeSet;

impl<E> ContextCore<E> {
    /// Checks `req` against this context's requirements.
    ///
    /// Returns the sentinel error the caller converts with
    /// [`ContextCore::privilege_error`].
    pub fn check_privilege(&self, req: &RegionRequirement) -> Result<(), PrivilegeError> {
        self.check_privilege_with(req, false)
    }

    /// As [`ContextCore::check_privilege`], optionally ignoring privilege
    /// bits and checking only paths and fields.
    pub fn check_privilege_with(
        &self,
        req: &RegionRequirement,
        skip_privilege: bool,
    ) -> Result<(), PrivilegeError> {
        if req.flags.contains(RequirementFlags::VERIFIED) {
            return Ok(());
        }
        let mut remaining = req.privilege_fields.clone();
        for ours in &self.regions {
            match self.check_against(req, ours, &mut remaining, skip_privilege) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_bad_parent() => {}
                Err(err) => return Err(err),
            }
        }
        // Path queries go to the forest, so work on a copy.
        let created: Vec<(RegionRequirement, bool)> = {
            let state = self.lock();
            state
                .created_requirements
                .iter()
                .cloned()
                .zip(state.returnable_privileges.iter().copied())
                .collect()
        };
        for (ours, returnable) in &created {
            match self.check_against(req, ours, &mut remaining, skip_privilege) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_bad_parent() => {
                    // The task made this region, so it holds every field.
                    if *returnable {
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
        // Whatever no parent covered must have been created here.
        let space = req.handle.field_space();
        let state = self.lock();
        match remaining
            .iter()
            .find(|fid| !state.resources.fields.is_created(&(space, **fid)))
        {
            Some(&fid) => Err(PrivilegeError::BadParentRegion { field: Some(fid) }),
            None => Ok(()),
        }
    }

    fn check_against(
        &self,
        req: &RegionRequirement,
        ours: &RegionRequirement,
        remaining: &mut BTreeSet<FieldId>,
        skip_privilege: bool,
    ) -> Result<(), PrivilegeError> {
        if ours.target_region() == Some(req.parent) {
            let is_region = req.handle_type() != HandleType::PartitionProjection;
            let forest = self.forest();
            let reachable = match (req.handle.region(), req.handle.partition()) {
                (Some(region), _) => {
                    forest.compute_index_path(req.parent.index_space, region.index_space)
                }
                (None, Some(partition)) => {
                    forest.compute_partition_path(req.parent.index_space, partition.index_partition)
                }
                (None, None) => false,
            };
            if !reachable {
                return Err(if is_region {
                    PrivilegeError::BadRegionPath
                } else {
                    PrivilegeError::BadPartitionPath
                });
            }
            let overlapping: Vec<FieldId> = remaining
                .intersection(&ours.privilege_fields)
                .copied()
                .collect();
            for fid in overlapping {
                if !skip_privilege && req.privilege.exceeds(ours.privilege) {
                    return Err(if is_region {
                        PrivilegeError::BadRegionPrivileges { field: fid }
                    } else {
                        PrivilegeError::BadPartitionPrivileges { field: fid }
                    });
                }
                remaining.remove(&fid);
            }
        }
        match remaining.iter().next() {
            Some(&fid) => Err(PrivilegeError::BadParentRegion { field: Some(fid) }),
            None => Ok(()),
        }
    }

    /// Checks an index space requirement against the task's index
    /// requirements, then against index spaces it created.
    pub fn check_index_privilege(&self, req: &IndexSpaceRequirement) -> Result<(), PrivilegeError> {
        if req.verified {
            return Ok(());
        }
        let forest = self.forest();
        if let Some(ours) = self.indexes.iter().find(|ours| ours.handle == req.parent) {
            if !forest.compute_index_path(req.parent, req.handle) {
                return Err(PrivilegeError::BadIndexPath);
            }
            if req.privilege.exceeds(ours.privilege) {
                return Err(PrivilegeError::BadIndexPrivileges);
            }
            return Ok(());
        }
        if self.lock().resources.index_spaces.is_created(&req.parent) {
            // Created spaces carry every privilege; only the path matters.
            if !forest.compute_index_path(req.parent, req.handle) {
                return Err(PrivilegeError::BadIndexPath);
            }
            return Ok(());
        }
        Err(PrivilegeError::BadParentIndex)
    }

    /// Converts a privilege sentinel for `req` into a user-facing error.
    #[must_use]
    pub fn privilege_error(&self, req: &RegionRequirement, err: PrivilegeError) -> ContextError {
        let kind = match err {
            PrivilegeError::BadIndexPath
            | PrivilegeError::BadIndexPrivileges
            | PrivilegeError::BadParentIndex => ErrorKind::BadParentIndex,
            _ => ErrorKind::BadParentRegion,
        };
        ContextError::new(
            kind,
            format!(
                "requirement on {:?} with parent {} in task {}: {err}",
                req.handle, req.parent, self.info()
            ),
        )
    }

    /// Finds the index of the requirement a child's `req` derives from.
    ///
    /// Static requirements must name `req.parent`, hold its privileges (when
    /// `check_privilege`) and contain its fields. A created requirement may
    /// absorb fields the task created; a returnable one absorbs any field.
    /// If every field was created by the task, a new non-returnable
    /// requirement on the tree root is appended as a last resort.
    pub fn find_parent_region_req(
        &self,
        req: &RegionRequirement,
        check_privilege: bool,
    ) -> Result<usize, ContextError> {
        let holds = |ours: &RegionRequirement| {
            !check_privilege || !req.privilege.exceeds(ours.privilege)
        };
        if let Some(idx) = self.regions.iter().position(|ours| {
            ours.target_region() == Some(req.parent)
                && holds(ours)
                && req.privilege_fields.is_subset(&ours.privilege_fields)
        }) {
            return Ok(idx);
        }
        let space = req.parent.field_space;
        let mut state = self.lock();
        let ContextState {
            created_requirements,
            returnable_privileges,
            resources,
            ..
        } = &mut *state;
        for (idx, (ours, &returnable)) in created_requirements
            .iter_mut()
            .zip(returnable_privileges.iter())
            .enumerate()
        {
            if ours.target_region() != Some(req.parent) || !holds(ours) {
                continue;
            }
            if returnable {
                ours.privilege_fields.extend(req.privilege_fields.iter().copied());
                return Ok(self.regions.len() + idx);
            }
            let dominated = req.privilege_fields.iter().all(|fid| {
                ours.privilege_fields.contains(fid) || resources.fields.is_created(&(space, *fid))
            });
            if dominated {
                ours.privilege_fields.extend(req.privilege_fields.iter().copied());
                return Ok(self.regions.len() + idx);
            }
        }
        let all_created = req
            .privilege_fields
            .iter()
            .all(|fid| resources.fields.is_created(&(space, *fid)));
        drop(state);
        if !all_created {
            return Err(self.bad_parent(format!(
                "has no region requirement covering {:?} with parent {} and fields {:?}",
                req.handle, req.parent, req.privilege_fields
            )));
        }
        let root = self.forest().tree_root(req.parent.tree);
        let mut state = self.lock();
        let new_req = RegionRequirement::region(root, PrivilegeMode::READ_WRITE, Coherence::Exclusive, root)
            .with_fields(req.privilege_fields.iter().copied());
        if !state.task_executed {
            state.physical_regions.push(PhysicalRegion::unmapped(new_req.clone()));
        }
        state.created_requirements.push(new_req);
        state.returnable_privileges.push(false);
        Ok(self.regions.len() + state.created_requirements.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::core::TaskRegions;
    use crate::operation::TaskInfo;
    use crate::test_utils::{MemoryForest, harness_runtime_with};
    use crate::types::{AllocateMode, FieldSpace, LogicalRegion};
    use std::sync::Arc;

    struct Fixture {
        forest: Arc<MemoryForest>,
        root: LogicalRegion,
        child: LogicalRegion,
        other: LogicalRegion,
        core: ContextCore<()>,
    }

    fn fixture(privilege: PrivilegeMode) -> Fixture {
        let forest = Arc::new(MemoryForest::new());
        let root = forest.new_tree(1);
        let child = forest.new_subregion(root);
        let other = forest.new_tree(1);
        let runtime = harness_runtime_with(RuntimeConfig::default(), Arc::clone(&forest));
        let uid = runtime.next_unique_id();
        let regions = vec![
            RegionRequirement::region(root, privilege, Coherence::Exclusive, root).with_fields([1, 2]),
        ];
        let core = ContextCore::new(runtime, TaskInfo::new(uid, "parent", 0), None, TaskRegions::new(regions), ());
        Fixture {
            forest,
            root,
            child,
            other,
            core,
        }
    }

    fn child_req(f: &Fixture, privilege: PrivilegeMode, fields: &[FieldId]) -> RegionRequirement {
        RegionRequirement::region(f.child, privilege, Coherence::Exclusive, f.root)
            .with_fields(fields.iter().copied())
    }

    #[test]
    fn subset_privileges_on_contained_fields_pass() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        assert_eq!(f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_ONLY, &[1])), Ok(()));
        assert_eq!(f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_WRITE, &[1, 2])), Ok(()));
    }

    #[test]
    fn excess_privilege_names_the_field() {
        let f = fixture(PrivilegeMode::READ_ONLY);
        assert_eq!(
            f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_WRITE, &[2])),
            Err(PrivilegeError::BadRegionPrivileges { field: 2 })
        );
    }

    #[test]
    fn write_discard_parent_satisfies_everything() {
        let f = fixture(PrivilegeMode::WRITE_DISCARD);
        assert_eq!(f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_WRITE, &[1])), Ok(()));
    }

    #[test]
    fn discarding_child_needs_a_discarding_parent() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        assert_eq!(
            f.core.check_privilege(&child_req(&f, PrivilegeMode::WRITE_DISCARD, &[1])),
            Err(PrivilegeError::BadRegionPrivileges { field: 1 })
        );
        let f = fixture(PrivilegeMode::WRITE_DISCARD);
        assert_eq!(f.core.check_privilege(&child_req(&f, PrivilegeMode::WRITE_DISCARD, &[1])), Ok(()));
    }

    #[test]
    fn missing_field_is_bad_parent() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        assert_eq!(
            f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_ONLY, &[1, 9])),
            Err(PrivilegeError::BadParentRegion { field: Some(9) })
        );
        f.core.register_field_creation(f.root.field_space, 9);
        assert_eq!(f.core.check_privilege(&child_req(&f, PrivilegeMode::READ_ONLY, &[1, 9])), Ok(()));
    }

    #[test]
    fn unreachable_region_is_bad_path() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        let req = RegionRequirement::region(f.other, PrivilegeMode::READ_ONLY, Coherence::Exclusive, f.root)
            .with_fields([1]);
        assert_eq!(f.core.check_privilege(&req), Err(PrivilegeError::BadRegionPath));
    }

    #[test]
    fn partition_path_and_privileges() {
        let f = fixture(PrivilegeMode::READ_ONLY);
        let part = f.forest.new_partition(f.root);
        let req = RegionRequirement::partition(part, PrivilegeMode::READ_WRITE, Coherence::Exclusive, f.root)
            .with_fields([1]);
        assert_eq!(
            f.core.check_privilege(&req),
            Err(PrivilegeError::BadPartitionPrivileges { field: 1 })
        );
        let ok = RegionRequirement::partition(part, PrivilegeMode::READ_ONLY, Coherence::Exclusive, f.root)
            .with_fields([1]);
        assert_eq!(f.core.check_privilege(&ok), Ok(()));
    }

    #[test]
    fn verified_requirements_skip_checks() {
        let f = fixture(PrivilegeMode::READ_ONLY);
        let req = child_req(&f, PrivilegeMode::READ_WRITE, &[42]).with_flags(RequirementFlags::VERIFIED);
        assert_eq!(f.core.check_privilege(&req), Ok(()));
    }

    #[test]
    fn created_region_grants_any_field() {
        let f = fixture(PrivilegeMode::READ_ONLY);
        let made = f.forest.new_tree(6);
        f.core.register_region_creation(made);
        let req = RegionRequirement::region(made, PrivilegeMode::READ_WRITE, Coherence::Exclusive, made)
            .with_fields([77]);
        assert_eq!(f.core.check_privilege(&req), Ok(()));
        assert_eq!(f.core.find_parent_region_req(&req, true), Ok(1));
        assert!(f.core.created_requirements()[0].privilege_fields.contains(&77));
    }

    #[test]
    fn parent_requirement_resolution() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        assert_eq!(f.core.find_parent_region_req(&child_req(&f, PrivilegeMode::READ_ONLY, &[2]), true), Ok(0));
        let err = f
            .core
            .find_parent_region_req(&child_req(&f, PrivilegeMode::READ_ONLY, &[5]), true)
            .expect_err("field 5 is not held");
        assert_eq!(err.kind(), ErrorKind::BadParentRegion);
    }

    #[test]
    fn created_fields_synthesize_a_root_requirement() {
        let f = fixture(PrivilegeMode::READ_WRITE);
        let fs: FieldSpace = f.root.field_space;
        f.core.register_field_creations(fs, [10, 11]);
        let idx = f
            .core
            .find_parent_region_req(&child_req(&f, PrivilegeMode::READ_WRITE, &[10, 11]), true)
            .expect("created fields grant privileges");
        assert_eq!(idx, 1);
        let created = f.core.created_requirements();
        assert_eq!(created[0].target_region(), Some(f.root));
        assert_eq!(created[0].privilege_fields, [10, 11].into_iter().collect());
        assert_eq!(f.core.returnable_privileges(), vec![false]);
    }

    #[test]
    fn index_privileges() {
        let forest = Arc::new(MemoryForest::new());
        let root = forest.new_tree(1);
        let sub = forest.new_subregion(root);
        let runtime = harness_runtime_with(RuntimeConfig::default(), Arc::clone(&forest));
        let uid = runtime.next_unique_id();
        let setup = TaskRegions::default().with_indexes(vec![IndexSpaceRequirement::new(
            root.index_space,
            AllocateMode::ALLOCABLE,
            root.index_space,
        )]);
        let core: ContextCore<()> = ContextCore::new(runtime, TaskInfo::new(uid, "idx", 0), None, setup, ());

        let ok = IndexSpaceRequirement::new(sub.index_space, AllocateMode::ALLOCABLE, root.index_space);
        assert_eq!(core.check_index_privilege(&ok), Ok(()));
        assert_eq!(core.find_parent_index_region(&ok), Ok(0));

        let greedy = IndexSpaceRequirement::new(sub.index_space, AllocateMode::MUTABLE, root.index_space);
        assert_eq!(core.check_index_privilege(&greedy), Err(PrivilegeError::BadIndexPrivileges));

        let stray = forest.new_tree(2);
        let orphan = IndexSpaceRequirement::new(sub.index_space, AllocateMode::ALLOCABLE, stray.index_space);
        assert_eq!(core.check_index_privilege(&orphan), Err(PrivilegeError::BadParentIndex));
        core.register_index_space_creation(stray.index_space);
        assert_eq!(core.check_index_privilege(&orphan), Err(PrivilegeError::BadIndexPath));
    }
}
