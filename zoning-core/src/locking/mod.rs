//! Migration locking
//!
//! Reference-counted locks that keep an entity, and every member of its
//! ownership hierarchy, from migrating while game logic depends on it.

pub mod hierarchy;
pub mod ownership;

pub use hierarchy::HierarchyRootIndex;
pub use ownership::{MigrationLockElement, OwnershipLockingPolicy};

use std::fmt;

use crate::types::EntityRef;
use crate::world::EntityWorld;

/// Opaque handle owning one increment of an entity's lock count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(u64);

impl LockToken {
    /// Returned when a lock could not be acquired
    pub const INVALID: LockToken = LockToken(0);

    /// Raw token value
    pub fn value(self) -> u64 {
        self.0
    }

    /// False for [`LockToken::INVALID`]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        LockToken(raw)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// Locking API consumed by the migration engine and the host
pub trait LockingPolicy {
    /// Whether this process may lock `entity`
    fn can_acquire_lock(&self, world: &dyn EntityWorld, entity: EntityRef) -> bool;

    /// Lock `entity`; returns [`LockToken::INVALID`] on failure
    fn acquire_lock(&mut self, world: &dyn EntityWorld, entity: EntityRef, debug_label: &str) -> LockToken;

    /// Release one lock; false if the token is unknown
    fn release_lock(&mut self, token: LockToken) -> bool;

    /// Whether `entity` or anything on its ownership chain is locked
    fn is_locked(&self, world: &dyn EntityWorld, entity: EntityRef) -> bool;

    /// Explicit lock count of `entity`
    fn lock_count(&self, entity: EntityRef) -> u32;

    /// Lock `entity` under a caller-chosen identifier
    fn acquire_lock_from_delegate(&mut self, world: &dyn EntityWorld, entity: EntityRef, identifier: &str) -> bool;

    /// Release the lock held under `identifier`
    fn release_lock_from_delegate(&mut self, entity: EntityRef, identifier: &str) -> bool;

    /// Must be called whenever the owner of `entity` changes
    fn on_owner_updated(&mut self, world: &dyn EntityWorld, entity: EntityRef, old_owner: Option<EntityRef>);
}
