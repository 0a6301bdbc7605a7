//! Virtual worker translation
//!
//! Read-only view of which physical worker and partition back each virtual
//! worker, plus the snapshot format the authoritative writer publishes.

pub mod map;
pub mod snapshot;

pub use map::VirtualWorkerMap;
pub use snapshot::{MappingEntry, MappingSnapshot};

use crate::types::{EntityId, PhysicalWorkerName, VirtualWorkerId};

/// Physical worker bound to a virtual worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalWorkerRecord {
    /// Worker name
    pub name: PhysicalWorkerName,
    /// System entity of the worker's connection
    pub system_entity_id: EntityId,
    /// Partition the worker was delegated
    pub partition_entity_id: EntityId,
}

/// Claimed partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Partition entity
    pub partition_entity_id: EntityId,
    /// Virtual worker the partition belongs to
    pub virtual_worker_id: VirtualWorkerId,
    /// System entity of the worker simulating it
    pub simulating_worker_system_entity_id: EntityId,
}
