//! Hierarchy root index
//!
//! Reverse index from a hierarchy root to the explicitly locked entities
//! below it.

use std::collections::HashMap;

use crate::types::EntityRef;

/// `root -> explicitly locked members`, members unique per root
#[derive(Debug, Default)]
pub struct HierarchyRootIndex {
    roots: HashMap<EntityRef, Vec<EntityRef>>,
}

impl HierarchyRootIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `member` under `root`
    ///
    /// Returns true when `root` was not tracked before and now needs a
    /// destruction watcher.
    pub fn add(&mut self, root: Option<EntityRef>, member: EntityRef) -> bool {
        let Some(root) = root else {
            return false;
        };
        let members = self.roots.entry(root).or_default();
        let newly_tracked = members.is_empty();
        if !members.contains(&member) {
            members.push(member);
        }
        newly_tracked
    }

    /// Remove `member` from `root`
    ///
    /// Returns true when `root` lost its last member and is no longer tracked.
    pub fn remove(&mut self, root: Option<EntityRef>, member: EntityRef) -> bool {
        let Some(root) = root else {
            return false;
        };
        let Some(members) = self.roots.get_mut(&root) else {
            return false;
        };
        members.retain(|m| *m != member);
        if members.is_empty() {
            self.roots.remove(&root);
            return true;
        }
        false
    }

    /// Whether `root` has at least one explicitly locked member
    pub fn is_tracked_root(&self, root: EntityRef) -> bool {
        self.roots.contains_key(&root)
    }

    /// Copy of the members under `root`
    pub fn members(&self, root: EntityRef) -> Vec<EntityRef> {
        self.roots.get(&root).cloned().unwrap_or_default()
    }

    /// Stop tracking `root`, returning its members
    pub fn remove_root(&mut self, root: EntityRef) -> Option<Vec<EntityRef>> {
        self.roots.remove(&root)
    }

    /// Number of tracked roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// True if no root is tracked
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let root = EntityRef(1);
        let mut index = HierarchyRootIndex::new();

        assert!(index.add(Some(root), EntityRef(2)));
        assert!(!index.add(Some(root), EntityRef(2)));
        assert!(!index.add(Some(root), EntityRef(3)));
        assert_eq!(index.members(root), vec![EntityRef(2), EntityRef(3)]);

        assert!(!index.remove(Some(root), EntityRef(2)));
        assert!(index.remove(Some(root), EntityRef(3)));
        assert!(!index.is_tracked_root(root));
        assert!(index.is_empty());
    }

    #[test]
    fn test_no_root_is_noop() {
        let mut index = HierarchyRootIndex::new();
        assert!(!index.add(None, EntityRef(2)));
        assert!(!index.remove(None, EntityRef(2)));
        assert!(index.is_empty());
    }
}
