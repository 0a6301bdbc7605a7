//! Identifiers shared across the zoning subsystem
//!
//! Runtime-visible ids (`EntityId`, `VirtualWorkerId`, `RequestId`) are plain
//! integers as the runtime hands them out; engine objects are addressed by
//! stable `EntityRef` handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime entity identifier
pub type EntityId = i64;

/// Logical shard identifier
pub type VirtualWorkerId = u32;

/// Outstanding asynchronous request identifier
pub type RequestId = i64;

/// Runtime component identifier
pub type ComponentId = u32;

/// Name of a running worker process
pub type PhysicalWorkerName = String;

/// Reserved "no entity" id
pub const INVALID_ENTITY_ID: EntityId = 0;

/// Reserved "unassigned" virtual worker id
pub const INVALID_VIRTUAL_WORKER_ID: VirtualWorkerId = 0;

/// Stable handle to an engine object.
///
/// Hierarchy relations are looked up through handles at use time; a handle
/// whose object is gone simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef(pub u64);

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Local network role of an engine object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorityRole {
    /// This process may mutate the object
    Authority,
    /// Authority is held (or about to be held) elsewhere
    SimulatedProxy,
}

/// Returns true if the id is a usable virtual worker id
pub fn is_valid_virtual_worker(id: VirtualWorkerId) -> bool {
    id != INVALID_VIRTUAL_WORKER_ID
}
