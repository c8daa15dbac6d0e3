//! Deletion analysis.
//!
//! A deletion operation must depend on every earlier use of the deleted name
//! in this context. For each requirement that can still touch the name, the
//! analysis produces an exclusive read-write requirement the deletion uses
//! for its dependence analysis, together with the index of the requirement it
//! derives from.

use super::core::ContextCore;
use crate::types::{
    Coherence, FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalPartition, LogicalRegion,
    PrivilegeMode, RegionRequirement,
};
use std::collections::BTreeSet;

/// A synthesized requirement and the index of the requirement it came from.
pub type DeleteRequirement = (RegionRequirement, usize);

fn delete_region(region: LogicalRegion, parent: LogicalRegion, fields: BTreeSet<FieldId>) -> RegionRequirement {
    let mut req = RegionRequirement::region(region, PrivilegeMode::READ_WRITE, Coherence::Exclusive, parent);
    req.privilege_fields = fields;
    req
}

fn delete_partition(
    partition: LogicalPartition,
    parent: LogicalRegion,
    fields: BTreeSet<FieldId>,
) -> RegionRequirement {
    let mut req =
        RegionRequirement::partition(partition, PrivilegeMode::READ_WRITE, Coherence::Exclusive, parent);
    req.privilege_fields = fields;
    req
}

impl<E> ContextCore<E> {
    /// Every requirement, static then created, with its index. Created ones
    /// are copied out so the forest can be queried without the lock.
    fn indexed_requirements(&self) -> Vec<(usize, RegionRequirement)> {
        let created = self.lock().created_requirements.clone();
        self.regions
            .iter()
            .cloned()
            .chain(created)
            .enumerate()
            .collect()
    }

    fn analyze_destroy(
        &self,
        mut visit: impl FnMut(LogicalRegion, &RegionRequirement) -> Option<RegionRequirement>,
    ) -> Vec<DeleteRequirement> {
        self.indexed_requirements()
            .into_iter()
            .filter_map(|(idx, ours)| {
                let region = ours.target_region()?;
                visit(region, &ours).map(|req| (req, idx))
            })
            .collect()
    }

    /// Requirements a deletion of index space `handle` depends through.
    #[must_use]
    pub fn analyze_destroy_index_space(&self, handle: IndexSpace) -> Vec<DeleteRequirement> {
        let forest = self.forest();
        self.analyze_destroy(|region, ours| {
            if region.index_space.tid != handle.tid || forest.are_disjoint(handle, region.index_space) {
                return None;
            }
            let target = if forest.compute_index_path(region.index_space, handle) {
                LogicalRegion::new(region.tree, handle, region.field_space)
            } else {
                region
            };
            Some(delete_region(target, region, ours.privilege_fields.clone()))
        })
    }

    /// Requirements a deletion of index partition `handle` depends through.
    #[must_use]
    pub fn analyze_destroy_index_partition(&self, handle: IndexPartition) -> Vec<DeleteRequirement> {
        let forest = self.forest();
        self.analyze_destroy(|region, ours| {
            if region.index_space.tid != handle.tid
                || forest.are_disjoint_partition(region.index_space, handle)
            {
                return None;
            }
            let fields = ours.privilege_fields.clone();
            Some(if forest.compute_partition_path(region.index_space, handle) {
                let partition = LogicalPartition::new(region.tree, handle, region.field_space);
                delete_partition(partition, region, fields)
            } else {
                delete_region(region, region, fields)
            })
        })
    }

    /// Requirements a deletion of field space `handle` depends through.
    #[must_use]
    pub fn analyze_destroy_field_space(&self, handle: FieldSpace) -> Vec<DeleteRequirement> {
        self.analyze_destroy(|region, ours| {
            (region.field_space == handle)
                .then(|| delete_region(region, region, ours.privilege_fields.clone()))
        })
    }

    /// Requirements a deletion of `fields` in `handle` depends through. Only
    /// the overlapping fields are kept.
    #[must_use]
    pub fn analyze_destroy_fields(
        &self,
        handle: FieldSpace,
        fields: &BTreeSet<FieldId>,
    ) -> Vec<DeleteRequirement> {
        self.analyze_destroy(|region, ours| {
            if region.field_space != handle {
                return None;
            }
            let overlap: BTreeSet<FieldId> =
                ours.privilege_fields.intersection(fields).copied().collect();
            (!overlap.is_empty()).then(|| delete_region(region, region, overlap))
        })
    }

    /// Requirements a deletion of region `handle` depends through.
    #[must_use]
    pub fn analyze_destroy_logical_region(&self, handle: LogicalRegion) -> Vec<DeleteRequirement> {
        let forest = self.forest();
        self.analyze_destroy(|region, ours| {
            if region.tree != handle.tree || forest.are_disjoint(handle.index_space, region.index_space) {
                return None;
            }
            let target = if forest.compute_index_path(region.index_space, handle.index_space) {
                handle
            } else {
                region
            };
            Some(delete_region(target, region, ours.privilege_fields.clone()))
        })
    }

    /// Requirements a deletion of partition `handle` depends through.
    #[must_use]
    pub fn analyze_destroy_logical_partition(&self, handle: LogicalPartition) -> Vec<DeleteRequirement> {
        let forest = self.forest();
        self.analyze_destroy(|region, ours| {
            if region.tree != handle.tree
                || forest.are_disjoint_partition(region.index_space, handle.index_partition)
            {
                return None;
            }
            let fields = ours.privilege_fields.clone();
            Some(
                if forest.compute_partition_path(region.index_space, handle.index_partition) {
                    delete_partition(handle, region, fields)
                } else {
                    delete_region(region, region, fields)
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::core::TaskRegions;
    use crate::operation::TaskInfo;
    use crate::test_utils::{MemoryForest, harness_runtime_with};
    use crate::types::HandleType;
    use std::sync::Arc;

    struct Fixture {
        forest: Arc<MemoryForest>,
        root: LogicalRegion,
        left: LogicalRegion,
        right: LogicalRegion,
        core: ContextCore<()>,
    }

    fn fixture() -> Fixture {
        let forest = Arc::new(MemoryForest::new());
        let root = forest.new_tree(1);
        let left = forest.new_subregion(root);
        let right = forest.new_subregion(root);
        let runtime = harness_runtime_with(RuntimeConfig::default(), Arc::clone(&forest));
        let uid = runtime.next_unique_id();
        let regions = vec![
            RegionRequirement::region(left, PrivilegeMode::READ_WRITE, Coherence::Exclusive, root)
                .with_fields([1, 2]),
            RegionRequirement::region(right, PrivilegeMode::READ_ONLY, Coherence::Exclusive, root)
                .with_fields([2]),
        ];
        let core = ContextCore::new(runtime, TaskInfo::new(uid, "deleter", 0), None, TaskRegions::new(regions), ());
        Fixture {
            forest,
            root,
            left,
            right,
            core,
        }
    }

    #[test]
    fn region_deletion_skips_disjoint_requirements() {
        let f = fixture();
        let inner = f.forest.new_subregion(f.left);
        let reqs = f.core.analyze_destroy_logical_region(inner);
        assert_eq!(reqs.len(), 1);
        let (req, idx) = &reqs[0];
        assert_eq!(*idx, 0);
        assert_eq!(req.target_region(), Some(inner));
        assert_eq!(req.parent, f.left);
        assert_eq!(req.privilege, PrivilegeMode::READ_WRITE);
        assert_eq!(req.coherence, Coherence::Exclusive);
    }

    #[test]
    fn deleting_an_ancestor_keeps_our_region() {
        let f = fixture();
        let reqs = f.core.analyze_destroy_logical_region(f.root);
        let targets: Vec<_> = reqs.iter().map(|(req, idx)| (req.target_region(), *idx)).collect();
        assert_eq!(targets, vec![(Some(f.left), 0), (Some(f.right), 1)]);
    }

    #[test]
    fn other_trees_are_ignored() {
        let f = fixture();
        let other = f.forest.new_tree(1);
        assert!(f.core.analyze_destroy_logical_region(other).is_empty());
        assert!(f.core.analyze_destroy_index_space(other.index_space).is_empty());
    }

    #[test]
    fn field_deletion_keeps_only_overlap() {
        let f = fixture();
        let doomed: BTreeSet<FieldId> = [2, 9].into_iter().collect();
        let reqs = f.core.analyze_destroy_fields(f.root.field_space, &doomed);
        assert_eq!(reqs.len(), 2);
        for (req, _) in &reqs {
            assert_eq!(req.privilege_fields, [2].into_iter().collect());
        }
        let none: BTreeSet<FieldId> = [7].into_iter().collect();
        assert!(f.core.analyze_destroy_fields(f.root.field_space, &none).is_empty());
    }

    #[test]
    fn field_space_deletion_covers_created_requirements() {
        let f = fixture();
        let created = f.forest.new_tree(1);
        f.core.register_region_creation(created);
        let reqs = f.core.analyze_destroy_field_space(f.root.field_space);
        assert_eq!(reqs.iter().map(|(_, idx)| *idx).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn partition_deletion_projects_when_reachable() {
        let f = fixture();
        let partition = f.forest.new_partition(f.left);
        let reqs = f.core.analyze_destroy_logical_partition(partition);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].0.handle_type(), HandleType::PartitionProjection);
        assert_eq!(reqs[0].0.parent, f.left);

        let by_index = f.core.analyze_destroy_index_partition(partition.index_partition);
        assert_eq!(by_index.len(), 1);
        assert_eq!(by_index[0].1, 0);
    }
}
