//! Ownership-aware locking policy
//!
//! An entity is locked when it holds explicit locks, when it is the hierarchy
//! root of an explicitly locked entity, or when its own hierarchy root is
//! either of those. Roots are cached per locked entity and recomputed when the
//! host reports an owner change.

use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::locking::{HierarchyRootIndex, LockToken, LockingPolicy};
use crate::metrics::standard::MIGRATION_LOCKS_HELD;
use crate::types::EntityRef;
use crate::world::{hierarchy_root, topmost_owner, EntityWorld};

/// Lock state of one explicitly locked entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLockElement {
    /// Locked entity
    pub entity: EntityRef,
    /// Outstanding tokens for the entity
    pub lock_count: u32,
    /// Hierarchy root when last computed; `None` for an unowned entity
    pub hierarchy_root: Option<EntityRef>,
}

/// Debug label and entity behind a token
#[derive(Debug, Clone)]
struct TokenEntry {
    label: String,
    entity: EntityRef,
}

/// Reference-counted migration locks over entities and their hierarchies
#[derive(Debug)]
pub struct OwnershipLockingPolicy {
    next_token: u64,
    locking_state: HashMap<EntityRef, MigrationLockElement>,
    tokens: HashMap<LockToken, TokenEntry>,
    root_index: HierarchyRootIndex,
    delegate_tokens: HashMap<String, LockToken>,
}

impl OwnershipLockingPolicy {
    /// Create an empty policy
    pub fn new() -> Self {
        Self {
            next_token: 1,
            locking_state: HashMap::new(),
            tokens: HashMap::new(),
            root_index: HierarchyRootIndex::new(),
            delegate_tokens: HashMap::new(),
        }
    }

    /// Whether `entity` holds at least one explicit lock
    pub fn is_explicitly_locked(&self, entity: EntityRef) -> bool {
        self.locking_state.contains_key(&entity)
    }

    /// Whether `entity` is the root of at least one explicitly locked entity
    pub fn is_locked_hierarchy_root(&self, entity: EntityRef) -> bool {
        self.root_index.is_tracked_root(entity)
    }

    /// Whether destruction of `entity` must be forwarded to this policy
    pub fn is_watching(&self, entity: EntityRef) -> bool {
        self.is_explicitly_locked(entity) || self.is_locked_hierarchy_root(entity)
    }

    /// Lock state of an explicitly locked entity
    pub fn lock_state(&self, entity: EntityRef) -> Option<&MigrationLockElement> {
        self.locking_state.get(&entity)
    }

    /// Debug label a token was acquired with
    pub fn token_label(&self, token: LockToken) -> Option<&str> {
        self.tokens.get(&token).map(|t| t.label.as_str())
    }

    /// Outstanding tokens
    pub fn outstanding_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Index of hierarchy roots to explicitly locked members
    pub fn hierarchy_index(&self) -> &HierarchyRootIndex {
        &self.root_index
    }

    /// Route one destruction notification to the matching hooks
    pub fn on_entity_destroyed(&mut self, world: &dyn EntityWorld, entity: EntityRef) {
        if self.is_explicitly_locked(entity) {
            self.on_explicitly_locked_entity_deleted(entity);
        }
        if self.is_locked_hierarchy_root(entity) {
            self.on_hierarchy_root_deleted(world, entity);
        }
    }

    /// Drop every token and lock state referencing a destroyed entity
    pub fn on_explicitly_locked_entity_deleted(&mut self, entity: EntityRef) {
        let Some(state) = self.locking_state.remove(&entity) else {
            error!("Deletion reported for {} which holds no migration lock", entity);
            return;
        };

        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.entity != entity);
        let removed = before - self.tokens.len();
        MIGRATION_LOCKS_HELD.add(-(removed as i64));

        let tokens = &self.tokens;
        self.delegate_tokens.retain(|_, token| tokens.contains_key(token));

        if self.root_index.remove(state.hierarchy_root, entity) {
            if let Some(root) = state.hierarchy_root {
                debug!("Stopped watching hierarchy root {}", root);
            }
        }
        debug!("Dropped {} migration locks on deleted {}", removed, entity);
    }

    /// Re-home explicitly locked members of a destroyed root, then forget it
    ///
    /// Returns false if `root` was not a tracked hierarchy root.
    pub fn on_hierarchy_root_deleted(&mut self, world: &dyn EntityWorld, root: EntityRef) -> bool {
        if !self.is_locked_hierarchy_root(root) {
            error!("Hierarchy root deletion reported for untracked {}", root);
            return false;
        }

        self.recalculate_hierarchy(world, root);

        if let Some(stale) = self.root_index.remove_root(root) {
            for member in stale {
                if let Some(state) = self.locking_state.get_mut(&member) {
                    if state.hierarchy_root == Some(root) {
                        state.hierarchy_root = None;
                    }
                }
            }
        }
        debug!("Hierarchy root {} deleted", root);
        true
    }

    fn recalculate_hierarchy(&mut self, world: &dyn EntityWorld, root: EntityRef) {
        for member in self.root_index.members(root) {
            self.recalculate_entity(world, member);
        }
    }

    fn recalculate_entity(&mut self, world: &dyn EntityWorld, entity: EntityRef) {
        let new_root = topmost_owner(world, entity);
        let Some(state) = self.locking_state.get_mut(&entity) else {
            return;
        };
        let old_root = state.hierarchy_root;
        if old_root == new_root {
            return;
        }
        state.hierarchy_root = new_root;

        self.root_index.remove(old_root, entity);
        self.root_index.add(new_root, entity);
        debug!(
            "Hierarchy root of {} moved from {:?} to {:?}",
            entity, old_root, new_root
        );
    }
}

impl Default for OwnershipLockingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LockingPolicy for OwnershipLockingPolicy {
    fn can_acquire_lock(&self, world: &dyn EntityWorld, entity: EntityRef) -> bool {
        if !world.exists(entity) {
            error!("Cannot lock {}: entity does not exist", entity);
            return false;
        }
        if world.entity_id(entity).is_none() {
            error!("Cannot lock {}: entity has no runtime id yet", entity);
            return false;
        }
        let has_authority = world.has_authority(entity);
        if !has_authority {
            warn!("Cannot lock {}: this worker does not have authority", entity);
        }
        has_authority
    }

    fn acquire_lock(&mut self, world: &dyn EntityWorld, entity: EntityRef, debug_label: &str) -> LockToken {
        if !self.can_acquire_lock(world, entity) {
            return LockToken::INVALID;
        }

        match self.locking_state.get_mut(&entity) {
            Some(state) => state.lock_count += 1,
            None => {
                let hierarchy_root = topmost_owner(world, entity);
                if self.root_index.add(hierarchy_root, entity) {
                    if let Some(root) = hierarchy_root {
                        debug!("Watching hierarchy root {}", root);
                    }
                }
                self.locking_state.insert(
                    entity,
                    MigrationLockElement {
                        entity,
                        lock_count: 1,
                        hierarchy_root,
                    },
                );
            }
        }

        let token = LockToken::from_raw(self.next_token);
        self.next_token += 1;
        self.tokens.insert(
            token,
            TokenEntry {
                label: debug_label.to_string(),
                entity,
            },
        );
        MIGRATION_LOCKS_HELD.inc();

        debug!("Acquired {} on {} ({})", token, entity, debug_label);
        token
    }

    fn release_lock(&mut self, token: LockToken) -> bool {
        let Some(entry) = self.tokens.remove(&token) else {
            error!("Called release_lock for unidentified token {}", token);
            return false;
        };
        MIGRATION_LOCKS_HELD.dec();

        let entity = entry.entity;
        if let Some(state) = self.locking_state.get_mut(&entity) {
            state.lock_count = state.lock_count.saturating_sub(1);
            if state.lock_count == 0 {
                let root = state.hierarchy_root;
                self.locking_state.remove(&entity);
                self.root_index.remove(root, entity);
            }
        }

        debug!("Released {} on {} ({})", token, entity, entry.label);
        true
    }

    fn is_locked(&self, world: &dyn EntityWorld, entity: EntityRef) -> bool {
        if self.is_explicitly_locked(entity) || self.is_locked_hierarchy_root(entity) {
            return true;
        }
        match topmost_owner(world, entity) {
            Some(root) => self.is_explicitly_locked(root) || self.is_locked_hierarchy_root(root),
            None => false,
        }
    }

    fn lock_count(&self, entity: EntityRef) -> u32 {
        self.locking_state.get(&entity).map_or(0, |s| s.lock_count)
    }

    fn acquire_lock_from_delegate(&mut self, world: &dyn EntityWorld, entity: EntityRef, identifier: &str) -> bool {
        if self.delegate_tokens.contains_key(identifier) {
            error!(
                "Delegate lock identifier \"{}\" already in use, cannot lock {}",
                identifier, entity
            );
            return false;
        }

        let token = self.acquire_lock(world, entity, &format!("Lock from delegate {}", identifier));
        if !token.is_valid() {
            return false;
        }
        self.delegate_tokens.insert(identifier.to_string(), token);
        true
    }

    fn release_lock_from_delegate(&mut self, entity: EntityRef, identifier: &str) -> bool {
        let Some(token) = self.delegate_tokens.remove(identifier) else {
            error!(
                "Unknown delegate lock identifier \"{}\" released for {}",
                identifier, entity
            );
            return false;
        };
        self.release_lock(token)
    }

    fn on_owner_updated(&mut self, world: &dyn EntityWorld, entity: EntityRef, old_owner: Option<EntityRef>) {
        if self.is_explicitly_locked(entity) {
            self.recalculate_entity(world, entity);
        }

        if self.is_locked_hierarchy_root(entity) {
            self.recalculate_hierarchy(world, entity);
        }

        // Detaching a subtree from a locked hierarchy must release its members
        if let Some(old_owner) = old_owner {
            let old_root = hierarchy_root(world, old_owner);
            if self.is_locked_hierarchy_root(old_root) {
                self.recalculate_hierarchy(world, old_root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::InMemoryWorld;
    use std::time::Instant;

    #[test]
    fn test_tokens_are_monotonic() {
        let mut world = InMemoryWorld::new();
        let e = world.spawn(1, Instant::now());
        let mut policy = OwnershipLockingPolicy::new();

        let t1 = policy.acquire_lock(&world, e, "a");
        let t2 = policy.acquire_lock(&world, e, "b");
        assert!(t1.is_valid());
        assert!(t2 > t1);
        assert_eq!(policy.token_label(t2), Some("b"));
    }

    #[test]
    fn test_untracked_entity_cannot_lock() {
        let mut world = InMemoryWorld::new();
        let e = world.spawn_untracked(Instant::now());
        let mut policy = OwnershipLockingPolicy::new();

        assert!(!policy.can_acquire_lock(&world, e));
        assert_eq!(policy.acquire_lock(&world, e, "x"), LockToken::INVALID);
        assert_eq!(policy.outstanding_tokens(), 0);
    }

    #[test]
    fn test_deletion_purges_delegates() {
        let mut world = InMemoryWorld::new();
        let e = world.spawn(1, Instant::now());
        let mut policy = OwnershipLockingPolicy::new();

        assert!(policy.acquire_lock_from_delegate(&world, e, "door"));
        assert!(policy.is_watching(e));
        world.destroy(e);
        policy.on_entity_destroyed(&world, e);

        assert!(!policy.is_watching(e));
        assert_eq!(policy.outstanding_tokens(), 0);
        assert!(!policy.release_lock_from_delegate(e, "door"));
    }
}
