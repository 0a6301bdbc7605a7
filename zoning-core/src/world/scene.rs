//! In-memory entity world
//!
//! Arena of scene entities keyed by [`EntityRef`]. Used by the simulation
//! binary and the tests as the host object model.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::types::{AuthorityRole, EntityId, EntityRef, VirtualWorkerId};
use crate::world::{EntityWorld, MigrationBlocker};

/// One object in the scene
#[derive(Debug, Clone)]
pub struct SceneEntity {
    /// Runtime id, `None` until the object is tracked
    pub entity_id: Option<EntityId>,
    /// Direct owner
    pub owner: Option<EntityRef>,
    /// Whether this process is authoritative
    pub authoritative: bool,
    /// Whether the object is replicated
    pub replicated: bool,
    /// Local network role
    pub role: AuthorityRole,
    /// When authority was last received
    pub authority_received_at: Option<Instant>,
    /// Creation time
    pub created_at: Instant,
    /// Forced blocker, reported by `migration_readiness`
    pub blocker: Option<MigrationBlocker>,
    /// Explicit hand-off destination
    pub remote_target: Option<EntityRef>,
    /// Last authority intent seen
    pub authority_intent: Option<VirtualWorkerId>,
    /// Objects that move with this one
    pub dependents: Vec<EntityRef>,
    /// Number of authority-lost notifications received
    pub authority_lost_count: u32,
}

/// Arena-backed [`EntityWorld`]
#[derive(Debug, Default)]
pub struct InMemoryWorld {
    entities: BTreeMap<EntityRef, SceneEntity>,
    next_handle: u64,
}

impl InMemoryWorld {
    /// Create an empty world
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_handle: 1,
        }
    }

    fn insert(&mut self, entity_id: Option<EntityId>, now: Instant) -> EntityRef {
        let handle = EntityRef(self.next_handle.max(1));
        self.next_handle = handle.0 + 1;
        self.entities.insert(
            handle,
            SceneEntity {
                entity_id,
                owner: None,
                authoritative: true,
                replicated: true,
                role: AuthorityRole::Authority,
                authority_received_at: None,
                created_at: now,
                blocker: None,
                remote_target: None,
                authority_intent: None,
                dependents: Vec::new(),
                authority_lost_count: 0,
            },
        );
        handle
    }

    /// Spawn an authoritative, replicated entity with a runtime id
    pub fn spawn(&mut self, entity_id: EntityId, now: Instant) -> EntityRef {
        self.insert(Some(entity_id), now)
    }

    /// Spawn an object that has no runtime id yet
    pub fn spawn_untracked(&mut self, now: Instant) -> EntityRef {
        self.insert(None, now)
    }

    /// Entity state, if it exists
    pub fn get(&self, entity: EntityRef) -> Option<&SceneEntity> {
        self.entities.get(&entity)
    }

    /// Mutable entity state, if it exists
    pub fn get_mut(&mut self, entity: EntityRef) -> Option<&mut SceneEntity> {
        self.entities.get_mut(&entity)
    }

    /// Look an object up by runtime id
    pub fn find(&self, entity_id: EntityId) -> Option<EntityRef> {
        self.entities
            .iter()
            .find(|(_, e)| e.entity_id == Some(entity_id))
            .map(|(handle, _)| *handle)
    }

    /// Take an object out of this world so another world can adopt it
    ///
    /// Unlike [`destroy`](Self::destroy), owner links are left alone: handles
    /// stay valid across worlds and a hierarchy is handed over member by member.
    pub fn remove(&mut self, entity: EntityRef) -> Option<SceneEntity> {
        self.entities.remove(&entity)
    }

    /// Insert an object under an existing handle, e.g. one handed over by another worker
    pub fn adopt(&mut self, entity: EntityRef, state: SceneEntity) {
        self.next_handle = self.next_handle.max(entity.0 + 1);
        self.entities.insert(entity, state);
    }

    /// Re-parent an object, returning the previous owner
    pub fn set_owner(&mut self, entity: EntityRef, owner: Option<EntityRef>) -> Option<EntityRef> {
        match self.entities.get_mut(&entity) {
            Some(e) => std::mem::replace(&mut e.owner, owner),
            None => None,
        }
    }

    /// Remove an object; objects it owned become unowned
    pub fn destroy(&mut self, entity: EntityRef) -> bool {
        if self.entities.remove(&entity).is_none() {
            return false;
        }
        for e in self.entities.values_mut() {
            if e.owner == Some(entity) {
                e.owner = None;
            }
            e.dependents.retain(|d| *d != entity);
        }
        trace!("Destroyed {}", entity);
        true
    }

    /// Make this process authoritative as of `at`
    pub fn grant_authority(&mut self, entity: EntityRef, at: Instant) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.authoritative = true;
            e.role = AuthorityRole::Authority;
            e.authority_received_at = Some(at);
        }
    }

    /// Set or clear authority without touching the timestamp
    pub fn set_authority(&mut self, entity: EntityRef, authoritative: bool) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.authoritative = authoritative;
        }
    }

    /// Set the replication flag
    pub fn set_replicated(&mut self, entity: EntityRef, replicated: bool) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.replicated = replicated;
        }
    }

    /// Force a migration blocker
    pub fn set_blocker(&mut self, entity: EntityRef, blocker: Option<MigrationBlocker>) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.blocker = blocker;
        }
    }

    /// Request an explicit hand-off towards `target`
    pub fn set_remote_target(&mut self, entity: EntityRef, target: Option<EntityRef>) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.remote_target = target;
        }
    }

    /// Record an authority intent seen for the object
    pub fn set_authority_intent(&mut self, entity: EntityRef, intent: Option<VirtualWorkerId>) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.authority_intent = intent;
        }
    }

    /// Make `dependent` move together with `entity`
    pub fn add_dependent(&mut self, entity: EntityRef, dependent: EntityRef) {
        if let Some(e) = self.entities.get_mut(&entity) {
            if !e.dependents.contains(&dependent) {
                e.dependents.push(dependent);
            }
        }
    }

    /// Current role of the object
    pub fn role(&self, entity: EntityRef) -> Option<AuthorityRole> {
        self.entities.get(&entity).map(|e| e.role)
    }

    /// Authority-lost notifications the object has received
    pub fn authority_lost_count(&self, entity: EntityRef) -> u32 {
        self.entities.get(&entity).map_or(0, |e| e.authority_lost_count)
    }

    /// Objects this process is authoritative over, in handle order
    pub fn authoritative_entities(&self) -> Vec<EntityRef> {
        self.entities
            .iter()
            .filter(|(_, e)| e.authoritative)
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True if the world holds no objects
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityWorld for InMemoryWorld {
    fn entity_id(&self, entity: EntityRef) -> Option<EntityId> {
        self.entities.get(&entity).and_then(|e| e.entity_id)
    }

    fn entity_by_id(&self, entity_id: EntityId) -> Option<EntityRef> {
        self.find(entity_id)
    }

    fn exists(&self, entity: EntityRef) -> bool {
        self.entities.contains_key(&entity)
    }

    fn owner(&self, entity: EntityRef) -> Option<EntityRef> {
        self.entities.get(&entity).and_then(|e| e.owner)
    }

    fn children(&self, entity: EntityRef) -> Vec<EntityRef> {
        self.entities
            .iter()
            .filter(|(_, e)| e.owner == Some(entity))
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn dependents(&self, entity: EntityRef) -> Vec<EntityRef> {
        self.entities
            .get(&entity)
            .map(|e| e.dependents.clone())
            .unwrap_or_default()
    }

    fn has_authority(&self, entity: EntityRef) -> bool {
        self.entities.get(&entity).is_some_and(|e| e.authoritative)
    }

    fn is_replicated(&self, entity: EntityRef) -> bool {
        self.entities.get(&entity).is_some_and(|e| e.replicated)
    }

    fn authority_received_at(&self, entity: EntityRef) -> Option<Instant> {
        self.entities.get(&entity).and_then(|e| e.authority_received_at)
    }

    fn time_since_creation(&self, entity: EntityRef, now: Instant) -> Duration {
        self.entities
            .get(&entity)
            .map_or(Duration::ZERO, |e| now.saturating_duration_since(e.created_at))
    }

    fn migration_readiness(&self, entity: EntityRef) -> Result<(), MigrationBlocker> {
        let e = self.entities.get(&entity).ok_or(MigrationBlocker::PendingDeletion)?;
        if !e.authoritative {
            return Err(MigrationBlocker::NotAuthoritative);
        }
        match e.blocker {
            Some(blocker) => Err(blocker),
            None if !e.replicated => Err(MigrationBlocker::MissingReplicationFlags),
            None => Ok(()),
        }
    }

    fn remote_migration_target(&self, entity: EntityRef) -> Option<EntityRef> {
        self.entities.get(&entity).and_then(|e| e.remote_target)
    }

    fn authority_intent(&self, entity: EntityRef) -> Option<VirtualWorkerId> {
        self.entities.get(&entity).and_then(|e| e.authority_intent)
    }

    fn set_role(&mut self, entity: EntityRef, role: AuthorityRole) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.role = role;
        }
    }

    fn on_authority_lost(&mut self, entity: EntityRef) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.authoritative = false;
            e.authority_lost_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_detaches_children() {
        let now = Instant::now();
        let mut world = InMemoryWorld::new();
        let parent = world.spawn(1, now);
        let child = world.spawn(2, now);
        world.set_owner(child, Some(parent));
        assert_eq!(world.children(parent), vec![child]);

        assert!(world.destroy(parent));
        assert!(!world.destroy(parent));
        assert_eq!(world.owner(child), None);
        assert!(!world.exists(parent));
    }

    #[test]
    fn test_readiness() {
        let now = Instant::now();
        let mut world = InMemoryWorld::new();
        let e = world.spawn(1, now);
        assert_eq!(world.migration_readiness(e), Ok(()));

        world.set_blocker(e, Some(MigrationBlocker::Streaming));
        assert_eq!(world.migration_readiness(e), Err(MigrationBlocker::Streaming));

        world.set_authority(e, false);
        assert_eq!(world.migration_readiness(e), Err(MigrationBlocker::NotAuthoritative));
    }

    #[test]
    fn test_authority_lost() {
        let now = Instant::now();
        let mut world = InMemoryWorld::new();
        let e = world.spawn(1, now);
        world.set_role(e, AuthorityRole::SimulatedProxy);
        world.on_authority_lost(e);

        assert_eq!(world.role(e), Some(AuthorityRole::SimulatedProxy));
        assert!(!world.has_authority(e));
        assert_eq!(world.authority_lost_count(e), 1);
        assert!(world.authoritative_entities().is_empty());
    }
}
