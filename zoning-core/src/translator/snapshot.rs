//! Mapping snapshot encoding
//!
//! The whole virtual worker mapping is written to the mapping entity as one
//! JSON document. Followers replace their map with each snapshot they receive.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{Result, ZoningError};
use crate::translator::PhysicalWorkerRecord;
use crate::types::{is_valid_virtual_worker, EntityId, VirtualWorkerId, INVALID_ENTITY_ID};

/// One virtual worker binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Virtual worker id
    pub virtual_worker_id: VirtualWorkerId,
    /// Physical worker simulating it
    pub physical_worker_name: String,
    /// System entity of that worker
    pub system_entity_id: EntityId,
    /// Partition claimed for the virtual worker
    pub partition_entity_id: EntityId,
}

/// Serialized form of the mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    /// Format version for compatibility
    pub version: u32,
    /// Publish counter of the writer
    pub generation: u64,
    /// Publish time
    pub published_at: DateTime<Utc>,
    /// Bindings in virtual worker order
    pub entries: Vec<MappingEntry>,
}

impl MappingSnapshot {
    /// Current snapshot format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Build a snapshot from the writer's records
    pub fn from_records(generation: u64, records: &BTreeMap<VirtualWorkerId, PhysicalWorkerRecord>) -> Self {
        let entries = records
            .iter()
            .map(|(virtual_worker_id, record)| MappingEntry {
                virtual_worker_id: *virtual_worker_id,
                physical_worker_name: record.name.clone(),
                system_entity_id: record.system_entity_id,
                partition_entity_id: record.partition_entity_id,
            })
            .collect();

        Self {
            version: Self::CURRENT_VERSION,
            generation,
            published_at: Utc::now(),
            entries,
        }
    }

    /// True if the snapshot binds no virtual worker
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to a component payload
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ZoningError::SnapshotCodec {
                reason: format!("Serialization failed: {}", e),
            })
    }

    /// Deserialize from a component payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(payload).map_err(|e| ZoningError::SnapshotCodec {
            reason: format!("Deserialization failed: {}", e),
        })?;

        if snapshot.version > Self::CURRENT_VERSION {
            return Err(ZoningError::SnapshotVersion {
                found: snapshot.version,
                supported: Self::CURRENT_VERSION,
            });
        }

        Ok(snapshot)
    }

    /// Validate snapshot consistency
    pub fn validate(&self) -> Result<()> {
        let mut seen_workers = HashSet::new();
        let mut seen_partitions = HashSet::new();

        for entry in &self.entries {
            if !is_valid_virtual_worker(entry.virtual_worker_id) {
                return Err(ZoningError::SnapshotInvalid {
                    reason: format!("Invalid virtual worker id for {}", entry.physical_worker_name),
                });
            }
            if !seen_workers.insert(entry.virtual_worker_id) {
                return Err(ZoningError::SnapshotInvalid {
                    reason: format!("Duplicate virtual worker id: {}", entry.virtual_worker_id),
                });
            }
            if entry.partition_entity_id == INVALID_ENTITY_ID {
                return Err(ZoningError::SnapshotInvalid {
                    reason: format!("Virtual worker {} has no partition", entry.virtual_worker_id),
                });
            }
            if !seen_partitions.insert(entry.partition_entity_id) {
                return Err(ZoningError::SnapshotInvalid {
                    reason: format!("Partition {} claimed twice", entry.partition_entity_id),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vw: VirtualWorkerId, name: &str, partition: EntityId) -> MappingEntry {
        MappingEntry {
            virtual_worker_id: vw,
            physical_worker_name: name.to_string(),
            system_entity_id: 1000 + vw as EntityId,
            partition_entity_id: partition,
        }
    }

    fn snapshot(entries: Vec<MappingEntry>) -> MappingSnapshot {
        MappingSnapshot {
            version: MappingSnapshot::CURRENT_VERSION,
            generation: 1,
            published_at: Utc::now(),
            entries,
        }
    }

    #[test]
    fn test_snapshot_bytes() {
        let snap = snapshot(vec![entry(1, "a", 200), entry(2, "b", 201)]);
        let bytes = snap.to_bytes().unwrap();
        let decoded = MappingSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, snap);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut snap = snapshot(vec![entry(1, "a", 200)]);
        snap.version = MappingSnapshot::CURRENT_VERSION + 1;
        let bytes = serde_json::to_vec(&snap).unwrap();

        match MappingSnapshot::from_bytes(&bytes) {
            Err(ZoningError::SnapshotVersion { found, supported }) => {
                assert_eq!(found, MappingSnapshot::CURRENT_VERSION + 1);
                assert_eq!(supported, MappingSnapshot::CURRENT_VERSION);
            }
            other => panic!("expected version error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            MappingSnapshot::from_bytes(b"not json"),
            Err(ZoningError::SnapshotCodec { .. })
        ));
    }

    #[test]
    fn test_validation() {
        assert!(snapshot(vec![entry(1, "a", 200), entry(1, "b", 201)]).validate().is_err());
        assert!(snapshot(vec![entry(1, "a", 200), entry(2, "b", 200)]).validate().is_err());
        assert!(snapshot(vec![entry(0, "a", 200)]).validate().is_err());
        assert!(snapshot(vec![entry(1, "a", INVALID_ENTITY_ID)]).validate().is_err());
    }
}
