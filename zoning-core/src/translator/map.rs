//! Follower-side virtual worker map
//!
//! Every worker keeps one. It is only ever replaced wholesale by snapshots
//! from the authoritative translation manager.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::translator::{MappingSnapshot, PartitionInfo, PhysicalWorkerRecord};
use crate::types::{EntityId, VirtualWorkerId};

/// Mapping from virtual workers to physical workers and partitions
#[derive(Debug, Clone)]
pub struct VirtualWorkerMap {
    local_worker_name: String,
    records: BTreeMap<VirtualWorkerId, PhysicalWorkerRecord>,
    partitions: Vec<PartitionInfo>,
    local_virtual_worker_id: Option<VirtualWorkerId>,
    claimed_partition_id: Option<EntityId>,
    generation: u64,
    local_change: Option<VirtualWorkerId>,
}

impl VirtualWorkerMap {
    /// Create an empty map for the worker named `local_worker_name`
    pub fn new(local_worker_name: impl Into<String>) -> Self {
        Self {
            local_worker_name: local_worker_name.into(),
            records: BTreeMap::new(),
            partitions: Vec::new(),
            local_virtual_worker_id: None,
            claimed_partition_id: None,
            generation: 0,
            local_change: None,
        }
    }

    /// Physical worker simulating `virtual_worker_id`
    pub fn physical_worker_for(&self, virtual_worker_id: VirtualWorkerId) -> Option<&str> {
        self.records.get(&virtual_worker_id).map(|r| r.name.as_str())
    }

    /// Partition entity claimed for `virtual_worker_id`
    pub fn partition_entity_for(&self, virtual_worker_id: VirtualWorkerId) -> Option<EntityId> {
        self.records.get(&virtual_worker_id).map(|r| r.partition_entity_id)
    }

    /// Virtual worker assigned to this process
    pub fn local_virtual_worker_id(&self) -> Option<VirtualWorkerId> {
        self.local_virtual_worker_id
    }

    /// True once this process knows its virtual worker id
    pub fn is_ready(&self) -> bool {
        self.local_virtual_worker_id.is_some()
    }

    /// Partition claimed for this process
    pub fn claimed_partition_id(&self) -> Option<EntityId> {
        self.claimed_partition_id
    }

    /// Name this process is known by
    pub fn local_physical_worker_name(&self) -> &str {
        &self.local_worker_name
    }

    /// Claimed partitions in virtual worker order
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Record for `virtual_worker_id`
    pub fn record(&self, virtual_worker_id: VirtualWorkerId) -> Option<&PhysicalWorkerRecord> {
        self.records.get(&virtual_worker_id)
    }

    /// Number of mapped virtual workers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Generation of the last applied snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a serialized snapshot, replacing the whole map
    ///
    /// Returns false if the payload was ignored; the previous mapping is kept.
    pub fn apply_update(&mut self, payload: &[u8]) -> bool {
        match MappingSnapshot::from_bytes(payload) {
            Ok(snapshot) => self.apply_snapshot(&snapshot),
            Err(e) => {
                warn!("Ignoring undecodable virtual worker mapping: {}", e);
                false
            }
        }
    }

    /// Apply a decoded snapshot, replacing the whole map
    pub fn apply_snapshot(&mut self, snapshot: &MappingSnapshot) -> bool {
        if snapshot.is_empty() {
            warn!("Received empty virtual worker mapping, keeping previous one");
            return false;
        }
        if let Err(e) = snapshot.validate() {
            warn!("Ignoring virtual worker mapping: {}", e);
            return false;
        }

        self.records.clear();
        self.partitions.clear();
        for entry in &snapshot.entries {
            self.records.insert(
                entry.virtual_worker_id,
                PhysicalWorkerRecord {
                    name: entry.physical_worker_name.clone(),
                    system_entity_id: entry.system_entity_id,
                    partition_entity_id: entry.partition_entity_id,
                },
            );
            self.partitions.push(PartitionInfo {
                partition_entity_id: entry.partition_entity_id,
                virtual_worker_id: entry.virtual_worker_id,
                simulating_worker_system_entity_id: entry.system_entity_id,
            });

            if entry.physical_worker_name == self.local_worker_name {
                self.claimed_partition_id = Some(entry.partition_entity_id);
                if self.local_virtual_worker_id != Some(entry.virtual_worker_id) {
                    info!(
                        "Worker {} assigned virtual worker {}",
                        self.local_worker_name, entry.virtual_worker_id
                    );
                    self.local_virtual_worker_id = Some(entry.virtual_worker_id);
                    self.local_change = Some(entry.virtual_worker_id);
                }
            }
        }
        self.generation = snapshot.generation;

        debug!(
            "Applied virtual worker mapping generation {} with {} entries",
            snapshot.generation,
            self.records.len()
        );
        true
    }

    /// Take the local virtual worker id if it changed since the last call
    pub fn take_local_virtual_worker_change(&mut self) -> Option<VirtualWorkerId> {
        self.local_change.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_initially() {
        let map = VirtualWorkerMap::new("w1");
        assert!(!map.is_ready());
        assert_eq!(map.local_virtual_worker_id(), None);
        assert_eq!(map.physical_worker_for(1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_garbage_payload_ignored() {
        let mut map = VirtualWorkerMap::new("w1");
        assert!(!map.apply_update(b"{"));
        assert!(!map.is_ready());
    }
}
