//! Created/deleted name tracking.

use std::collections::BTreeSet;

/// Names a context created, and inherited names it deleted.
///
/// A name is never in both sets. Deleting a created name removes it and
/// reports that the deletion can be finalized now; deleting any other name
/// records it so the deletion flows back to the parent context.
#[derive(Debug, Clone)]
pub struct ResourceTracker<T: Ord> {
    created: BTreeSet<T>,
    deleted: BTreeSet<T>,
}

impl<T: Ord> Default for ResourceTracker<T> {
    fn default() -> Self {
        Self {
            created: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> ResourceTracker<T> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a creation.
    pub fn register_creation(&mut self, name: T) {
        debug_assert!(!self.created.contains(&name), "name registered as created twice");
        debug_assert!(!self.deleted.contains(&name), "created name was already deleted");
        self.created.insert(name);
    }

    /// Records a deletion. Returns true if the name was created here and the
    /// deletion takes effect immediately.
    pub fn register_deletion(&mut self, name: T) -> bool {
        if self.created.remove(&name) {
            true
        } else {
            self.deleted.insert(name);
            false
        }
    }

    /// Drops created names matching `pred` without recording deletions.
    pub fn purge_created(&mut self, mut pred: impl FnMut(&T) -> bool) {
        self.created.retain(|name| !pred(name));
    }

    /// True if `name` was created here and not yet deleted.
    #[must_use]
    pub fn is_created(&self, name: &T) -> bool {
        self.created.contains(name)
    }

    /// True if the inherited `name` was deleted here.
    #[must_use]
    pub fn is_deleted(&self, name: &T) -> bool {
        self.deleted.contains(name)
    }

    /// Live created names.
    #[must_use]
    pub const fn created(&self) -> &BTreeSet<T> {
        &self.created
    }

    /// Deleted inherited names.
    #[must_use]
    pub const fn deleted(&self) -> &BTreeSet<T> {
        &self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn created_then_deleted_finalizes() {
        let mut tracker = ResourceTracker::new();
        tracker.register_creation(7u32);
        assert!(tracker.is_created(&7));
        assert!(tracker.register_deletion(7));
        assert!(!tracker.is_created(&7));
        assert!(!tracker.is_deleted(&7));
    }

    #[test]
    fn inherited_deletion_is_deferred() {
        let mut tracker = ResourceTracker::<u32>::new();
        assert!(!tracker.register_deletion(3));
        assert!(tracker.is_deleted(&3));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Create(u8),
        Delete(u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![(0u8..16).prop_map(Step::Create), (0u8..16).prop_map(Step::Delete)]
    }

    proptest! {
        #[test]
        fn never_created_and_deleted(steps in proptest::collection::vec(step(), 0..64)) {
            let mut tracker = ResourceTracker::new();
            for step in steps {
                match step {
                    Step::Create(name) => {
                        if !tracker.is_created(&name) && !tracker.is_deleted(&name) {
                            tracker.register_creation(name);
                        }
                    }
                    Step::Delete(name) => {
                        tracker.register_deletion(name);
                    }
                }
                prop_assert!(tracker.created().is_disjoint(tracker.deleted()));
            }
        }
    }
}
