//! Engine object model seam
//!
//! The zoning subsystem never owns engine objects. It reads ownership
//! hierarchies, authority and readiness through [`EntityWorld`] and looks
//! relations up on demand, so a handle whose object is gone simply stops
//! resolving.

pub mod scene;

pub use scene::InMemoryWorld;

use std::time::{Duration, Instant};
use thiserror::Error;

use crate::types::{AuthorityRole, EntityId, EntityRef, VirtualWorkerId};

/// Upper bound on owner-chain length; a longer chain is treated as a cycle
const MAX_OWNER_DEPTH: usize = 1024;

/// Reason a hierarchy member cannot migrate right now
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MigrationBlocker {
    #[error("does not have authority")]
    NotAuthoritative,
    #[error("is not ready")]
    NotReady,
    #[error("is pending deletion")]
    PendingDeletion,
    #[error("is not initialized")]
    NotInitialized,
    #[error("is streaming in or out")]
    Streaming,
    #[error("is a startup entity and initially net dormant")]
    NetDormant,
    #[error("does not have replication flags")]
    MissingReplicationFlags,
    #[error("is dormant on connection")]
    DormantOnConnection,
}

/// Read and notification surface of the host's object model
pub trait EntityWorld {
    /// Runtime id of an object, if it is a tracked entity yet
    fn entity_id(&self, entity: EntityRef) -> Option<EntityId>;

    /// Whether the object still exists
    fn exists(&self, entity: EntityRef) -> bool;

    /// Object currently carrying runtime id `entity_id`
    fn entity_by_id(&self, entity_id: EntityId) -> Option<EntityRef>;

    /// Direct owner in the ownership hierarchy
    fn owner(&self, entity: EntityRef) -> Option<EntityRef>;

    /// Objects directly owned by `entity`
    fn children(&self, entity: EntityRef) -> Vec<EntityRef>;

    /// Objects that must move together with `entity` without being owned by it
    fn dependents(&self, _entity: EntityRef) -> Vec<EntityRef> {
        Vec::new()
    }

    /// Whether this process is authoritative over the object
    fn has_authority(&self, entity: EntityRef) -> bool;

    /// Whether the object is replicated to other workers
    fn is_replicated(&self, entity: EntityRef) -> bool;

    /// When this process last gained authority over the object
    fn authority_received_at(&self, entity: EntityRef) -> Option<Instant>;

    /// Age of the object at `now`
    fn time_since_creation(&self, entity: EntityRef, now: Instant) -> Duration;

    /// Whether the object could migrate right now
    fn migration_readiness(&self, entity: EntityRef) -> Result<(), MigrationBlocker>;

    /// Explicit hand-off destination requested for the object
    fn remote_migration_target(&self, entity: EntityRef) -> Option<EntityRef>;

    /// Last authority intent seen on the object
    fn authority_intent(&self, entity: EntityRef) -> Option<VirtualWorkerId>;

    /// Change the local network role of the object
    fn set_role(&mut self, entity: EntityRef, role: AuthorityRole);

    /// Tell the object it is about to lose authority
    fn on_authority_lost(&mut self, entity: EntityRef);
}

/// Topmost owner of `entity`, or `None` when it has no owner
pub fn topmost_owner<W: EntityWorld + ?Sized>(world: &W, entity: EntityRef) -> Option<EntityRef> {
    let mut current = world.owner(entity)?;
    for _ in 0..MAX_OWNER_DEPTH {
        match world.owner(current) {
            Some(next) if next != entity => current = next,
            _ => return Some(current),
        }
    }
    Some(current)
}

/// Hierarchy root ("net owner") of `entity`: its topmost owner, or itself
pub fn hierarchy_root<W: EntityWorld + ?Sized>(world: &W, entity: EntityRef) -> EntityRef {
    topmost_owner(world, entity).unwrap_or(entity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_root() {
        let now = Instant::now();
        let mut world = InMemoryWorld::new();
        let root = world.spawn(10, now);
        let mid = world.spawn(11, now);
        let leaf = world.spawn(12, now);
        world.set_owner(mid, Some(root));
        world.set_owner(leaf, Some(mid));

        assert_eq!(topmost_owner(&world, leaf), Some(root));
        assert_eq!(topmost_owner(&world, root), None);
        assert_eq!(hierarchy_root(&world, root), root);
        assert_eq!(hierarchy_root(&world, leaf), root);
    }

    #[test]
    fn test_owner_cycle_terminates() {
        let now = Instant::now();
        let mut world = InMemoryWorld::new();
        let a = world.spawn(1, now);
        let b = world.spawn(2, now);
        world.set_owner(a, Some(b));
        world.set_owner(b, Some(a));

        assert_eq!(topmost_owner(&world, a), Some(b));
    }

    #[test]
    fn test_blocker_messages() {
        assert_eq!(MigrationBlocker::NotAuthoritative.to_string(), "does not have authority");
        assert_eq!(MigrationBlocker::Streaming.to_string(), "is streaming in or out");
    }
}
