//! Unit tests for the follower-side virtual worker map
//!
//! Tests readiness, whole-snapshot replacement and rejected payloads.

use chrono::Utc;
use zoning_core::translator::{MappingEntry, MappingSnapshot, VirtualWorkerMap};

fn entry(virtual_worker_id: u32, name: &str, partition: i64) -> MappingEntry {
    MappingEntry {
        virtual_worker_id,
        physical_worker_name: name.to_string(),
        system_entity_id: 500 + virtual_worker_id as i64,
        partition_entity_id: partition,
    }
}

fn payload(generation: u64, entries: Vec<MappingEntry>) -> Vec<u8> {
    let snapshot = MappingSnapshot {
        version: MappingSnapshot::CURRENT_VERSION,
        generation,
        published_at: Utc::now(),
        entries,
    };
    snapshot.to_bytes().unwrap().to_vec()
}

#[test]
fn test_not_ready_before_mapping() {
    let map = VirtualWorkerMap::new("ValidWorkerOne");
    assert!(!map.is_ready());
    assert_eq!(map.local_virtual_worker_id(), None);
    assert_eq!(map.claimed_partition_id(), None);
}

#[test]
fn test_empty_mapping_ignored() {
    let mut map = VirtualWorkerMap::new("ValidWorkerOne");
    assert!(!map.apply_update(&payload(1, vec![])));
    assert!(!map.is_ready());
    assert_eq!(map.generation(), 0);
}

#[test]
fn test_valid_mapping_makes_ready() {
    let mut map = VirtualWorkerMap::new("ValidWorkerOne");
    let applied = map.apply_update(&payload(
        1,
        vec![entry(1, "ValidWorkerOne", 200), entry(2, "ValidWorkerTwo", 201)],
    ));

    assert!(applied);
    assert!(map.is_ready());
    assert_eq!(map.local_virtual_worker_id(), Some(1));
    assert_eq!(map.claimed_partition_id(), Some(200));
    assert_eq!(map.physical_worker_for(2), Some("ValidWorkerTwo"));
    assert_eq!(map.partition_entity_for(2), Some(201));
    assert_eq!(map.partitions().len(), 2);
    assert_eq!(map.take_local_virtual_worker_change(), Some(1));
    assert_eq!(map.take_local_virtual_worker_change(), None);
}

#[test]
fn test_second_mapping_replaces_first() {
    let mut map = VirtualWorkerMap::new("ValidWorkerOne");
    map.apply_update(&payload(
        1,
        vec![
            entry(1, "ValidWorkerOne", 200),
            entry(2, "ValidWorkerTwo", 201),
            entry(3, "ValidWorkerThree", 202),
        ],
    ));
    map.apply_update(&payload(2, vec![entry(1, "ValidWorkerTwo", 300), entry(2, "ValidWorkerOne", 301)]));

    assert_eq!(map.len(), 2);
    assert_eq!(map.generation(), 2);
    assert_eq!(map.local_virtual_worker_id(), Some(2));
    assert_eq!(map.claimed_partition_id(), Some(301));
    assert_eq!(map.physical_worker_for(1), Some("ValidWorkerTwo"));
    assert_eq!(map.physical_worker_for(3), None);
    assert_eq!(map.partition_entity_for(3), None);
}

#[test]
fn test_local_id_kept_when_absent() {
    let mut map = VirtualWorkerMap::new("ValidWorkerOne");
    map.apply_update(&payload(1, vec![entry(1, "ValidWorkerOne", 200)]));
    map.apply_update(&payload(2, vec![entry(2, "ValidWorkerTwo", 201)]));

    assert_eq!(map.local_virtual_worker_id(), Some(1));
    assert_eq!(map.physical_worker_for(1), None);
}

#[test]
fn test_invalid_mapping_keeps_previous() {
    let mut map = VirtualWorkerMap::new("ValidWorkerOne");
    map.apply_update(&payload(1, vec![entry(1, "ValidWorkerOne", 200)]));

    let duplicate = payload(2, vec![entry(2, "A", 300), entry(2, "B", 301)]);
    assert!(!map.apply_update(&duplicate));
    assert!(!map.apply_update(b"\x00\x01garbage"));

    assert_eq!(map.generation(), 1);
    assert_eq!(map.physical_worker_for(1), Some("ValidWorkerOne"));
}
