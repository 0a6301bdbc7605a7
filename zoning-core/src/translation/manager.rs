//! Translation manager control loop
//!
//! Discovers the server worker roster, binds each ready worker to a free
//! virtual worker with a freshly created partition, reclaims partitions of
//! departed workers, and publishes the whole mapping once it is complete.
//! Every transition is driven by an authority change or a request response.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::connection::component_ids::TRANSLATION_AUTH_COMPONENT_SET_ID;
use crate::connection::well_known::VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID;
use crate::connection::{
    ComponentUpdate, EntityQuery, RetryPolicy, StatusCode, WorkerConnection, WorkerEntityRecord, WorkerOp,
};
use crate::correlator::RequestCorrelator;
use crate::metrics::standard::{MAPPING_PUBLISHES, ROSTER_QUERIES, VIRTUAL_WORKERS_ASSIGNED};
use crate::translator::{MappingSnapshot, PartitionInfo, PhysicalWorkerRecord};
use crate::types::{EntityId, RequestId, VirtualWorkerId};
use crate::DEFAULT_ROSTER_POLL_INTERVAL_MS;

/// Configuration for the translation manager
#[derive(Debug, Clone)]
pub struct TranslationManagerConfig {
    /// How often a complete mapping re-checks the roster for departures
    pub roster_poll_interval: Duration,
}

impl Default for TranslationManagerConfig {
    fn default() -> Self {
        Self {
            roster_poll_interval: Duration::from_millis(DEFAULT_ROSTER_POLL_INTERVAL_MS),
        }
    }
}

/// Control loop phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationPhase {
    /// Not authoritative over the mapping entity
    Idle,
    /// Waiting for a roster response
    Discovering,
    /// Creating or claiming partitions for new workers
    Assigning,
    /// Mapping complete and published
    Publishing,
    /// Taking partitions back from departed workers
    Reclaiming,
}

/// Continuation for an outstanding request
#[derive(Debug, Clone)]
enum PendingRequest {
    WorkerQuery,
    CreatePartition {
        virtual_worker_id: VirtualWorkerId,
        worker: WorkerEntityRecord,
    },
    ClaimPartition {
        virtual_worker_id: VirtualWorkerId,
        partition_entity_id: EntityId,
        worker: WorkerEntityRecord,
    },
    ReclaimPartition {
        virtual_worker_id: VirtualWorkerId,
        partition_entity_id: EntityId,
        worker_name: String,
    },
}

/// Single-writer owner of the virtual worker mapping
pub struct TranslationManager {
    config: TranslationManagerConfig,
    num_virtual_workers: u32,
    unassigned: BTreeSet<VirtualWorkerId>,
    mapping: BTreeMap<VirtualWorkerId, PhysicalWorkerRecord>,
    partitions: Vec<PartitionInfo>,
    requests: RequestCorrelator<PendingRequest>,
    assigning: HashSet<String>,
    reclaiming: HashSet<VirtualWorkerId>,
    query_in_flight: bool,
    last_roster_query: Option<Instant>,
    generation: u64,
    authoritative: bool,
    phase: TranslationPhase,
}

impl TranslationManager {
    /// Create a manager that will assign `num_virtual_workers` ids
    pub fn new(config: TranslationManagerConfig, num_virtual_workers: u32) -> Self {
        let mut manager = Self {
            config,
            num_virtual_workers: 0,
            unassigned: BTreeSet::new(),
            mapping: BTreeMap::new(),
            partitions: Vec::new(),
            requests: RequestCorrelator::new(),
            assigning: HashSet::new(),
            reclaiming: HashSet::new(),
            query_in_flight: false,
            last_roster_query: None,
            generation: 0,
            authoritative: false,
            phase: TranslationPhase::Idle,
        };
        manager.set_number_of_virtual_workers(num_virtual_workers);
        manager
    }

    /// Set the number of virtual workers to assign, ids `1..=count`
    pub fn set_number_of_virtual_workers(&mut self, count: u32) {
        self.num_virtual_workers = count;
        let in_flight = self.in_flight_virtual_workers();
        self.unassigned = (1..=count)
            .filter(|id| !self.mapping.contains_key(id) && !in_flight.contains(id))
            .collect();
        debug!("Virtual workers to assign: {:?}", self.unassigned);
    }

    /// Current phase
    pub fn phase(&self) -> TranslationPhase {
        self.phase
    }

    /// Whether this worker owns the mapping
    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Number of virtual workers the mapping must bind
    pub fn num_virtual_workers(&self) -> u32 {
        self.num_virtual_workers
    }

    /// Last known good mapping
    pub fn mapping(&self) -> &BTreeMap<VirtualWorkerId, PhysicalWorkerRecord> {
        &self.mapping
    }

    /// Claimed partitions
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Virtual worker ids not bound or being bound, lowest first
    pub fn unassigned_virtual_workers(&self) -> impl Iterator<Item = VirtualWorkerId> + '_ {
        self.unassigned.iter().copied()
    }

    /// Requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Number of snapshots published
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once every virtual worker is bound
    pub fn is_complete(&self) -> bool {
        self.mapping.len() as u32 >= self.num_virtual_workers
    }

    /// Adopt a snapshot published by another writer while not authoritative
    pub fn observe_published(&mut self, snapshot: &MappingSnapshot) {
        if self.authoritative {
            return;
        }
        self.mapping = snapshot
            .entries
            .iter()
            .map(|e| {
                (
                    e.virtual_worker_id,
                    PhysicalWorkerRecord {
                        name: e.physical_worker_name.clone(),
                        system_entity_id: e.system_entity_id,
                        partition_entity_id: e.partition_entity_id,
                    },
                )
            })
            .collect();
        self.partitions = snapshot
            .entries
            .iter()
            .map(|e| PartitionInfo {
                partition_entity_id: e.partition_entity_id,
                virtual_worker_id: e.virtual_worker_id,
                simulating_worker_system_entity_id: e.system_entity_id,
            })
            .collect();
        self.generation = self.generation.max(snapshot.generation);
        self.set_number_of_virtual_workers(self.num_virtual_workers);
    }

    /// Route one op; returns true if the op was consumed
    pub fn handle_op(&mut self, connection: &mut dyn WorkerConnection, op: &WorkerOp, now: Instant) -> bool {
        match op {
            WorkerOp::AuthorityChange {
                entity_id,
                component_set_id,
                authoritative,
            } if *entity_id == VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID
                && *component_set_id == TRANSLATION_AUTH_COMPONENT_SET_ID =>
            {
                self.authority_changed(connection, *authoritative, now);
                true
            }
            WorkerOp::EntityQueryResponse {
                request_id,
                status,
                results,
            } => self.on_response(*request_id, |manager, request| {
                manager.on_roster_response(connection, request, status, results, now)
            }),
            WorkerOp::CreateEntityResponse {
                request_id,
                status,
                entity_id,
            } => self.on_response(*request_id, |manager, request| {
                manager.on_partition_created(connection, request, status, *entity_id, now)
            }),
            WorkerOp::ClaimPartitionResponse { request_id, status } => {
                self.on_response(*request_id, |manager, request| {
                    manager.on_partition_claimed(connection, request, status, now)
                })
            }
            WorkerOp::ReclaimPartitionResponse { request_id, status } => {
                self.on_response(*request_id, |manager, request| {
                    manager.on_partition_reclaimed(connection, request, status, now)
                })
            }
            _ => false,
        }
    }

    /// Gain or lose authority over the mapping entity
    pub fn authority_changed(&mut self, connection: &mut dyn WorkerConnection, authoritative: bool, now: Instant) {
        if authoritative == self.authoritative {
            return;
        }
        self.authoritative = authoritative;

        if authoritative {
            info!("Gained authority over the virtual worker mapping");
            self.send_roster_query(connection, now);
        } else {
            info!("Lost authority over the virtual worker mapping");
            let in_flight = self.in_flight_virtual_workers();
            self.unassigned.extend(in_flight);
            self.requests.clear();
            self.assigning.clear();
            self.reclaiming.clear();
            self.query_in_flight = false;
            self.phase = TranslationPhase::Idle;
        }
    }

    /// Periodic work: re-poll the roster of a complete mapping
    pub fn poll(&mut self, connection: &mut dyn WorkerConnection, now: Instant) {
        if !self.authoritative || self.phase != TranslationPhase::Publishing || !self.requests.is_empty() {
            return;
        }
        let due = self
            .last_roster_query
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.roster_poll_interval);
        if due {
            self.send_roster_query(connection, now);
        }
    }

    fn on_response<F>(&mut self, request_id: RequestId, handle: F) -> bool
    where
        F: FnOnce(&mut Self, PendingRequest),
    {
        match self.requests.take(request_id) {
            Some(request) => {
                handle(self, request);
                true
            }
            None => false,
        }
    }

    fn send_roster_query(&mut self, connection: &mut dyn WorkerConnection, now: Instant) {
        let request_id = self.requests.send_and_register(
            || connection.send_entity_query(EntityQuery::server_workers(), RetryPolicy::UntilComplete),
            PendingRequest::WorkerQuery,
        );
        self.query_in_flight = true;
        self.last_roster_query = Some(now);
        ROSTER_QUERIES.inc();

        if self.assigning.is_empty() && self.reclaiming.is_empty() {
            self.phase = TranslationPhase::Discovering;
        }
        debug!("Sent server worker roster query {}", request_id);
    }

    fn on_roster_response(
        &mut self,
        connection: &mut dyn WorkerConnection,
        request: PendingRequest,
        status: &StatusCode,
        workers: &[WorkerEntityRecord],
        now: Instant,
    ) {
        debug_assert!(matches!(request, PendingRequest::WorkerQuery));
        self.query_in_flight = false;

        if !status.is_success() {
            warn!("Server worker roster query failed ({:?}), retrying", status);
            self.send_roster_query(connection, now);
            return;
        }

        if let Some(unready) = workers.iter().find(|w| !w.ready) {
            info!(
                "Not all server workers are ready ({} is not), retrying roster query",
                unready.name
            );
            self.send_roster_query(connection, now);
            return;
        }

        let roster: HashSet<&str> = workers.iter().map(|w| w.name.as_str()).collect();

        // Departures
        let departed: Vec<(VirtualWorkerId, PhysicalWorkerRecord)> = self
            .mapping
            .iter()
            .filter(|(id, record)| !roster.contains(record.name.as_str()) && !self.reclaiming.contains(id))
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        for (virtual_worker_id, record) in departed {
            info!(
                "Worker {} left, reclaiming partition {} of virtual worker {}",
                record.name, record.partition_entity_id, virtual_worker_id
            );
            let partition_entity_id = record.partition_entity_id;
            self.requests.send_and_register(
                || connection.send_reclaim_partition(partition_entity_id, RetryPolicy::UntilComplete),
                PendingRequest::ReclaimPartition {
                    virtual_worker_id,
                    partition_entity_id,
                    worker_name: record.name,
                },
            );
            self.reclaiming.insert(virtual_worker_id);
            self.phase = TranslationPhase::Reclaiming;
        }

        // Arrivals
        for worker in workers {
            let mapped = self.mapping.values().any(|r| r.name == worker.name);
            if mapped || self.assigning.contains(&worker.name) {
                continue;
            }
            let Some(virtual_worker_id) = self.unassigned.pop_first() else {
                debug!("No free virtual worker for {}", worker.name);
                continue;
            };

            debug!(
                "Assigning virtual worker {} to {}, creating partition",
                virtual_worker_id, worker.name
            );
            self.requests.send_and_register(
                || connection.send_create_partition(virtual_worker_id, RetryPolicy::UntilComplete),
                PendingRequest::CreatePartition {
                    virtual_worker_id,
                    worker: worker.clone(),
                },
            );
            self.assigning.insert(worker.name.clone());
            if self.reclaiming.is_empty() {
                self.phase = TranslationPhase::Assigning;
            }
        }

        self.settle(connection, now);
    }

    fn on_partition_created(
        &mut self,
        connection: &mut dyn WorkerConnection,
        request: PendingRequest,
        status: &StatusCode,
        partition_entity_id: Option<EntityId>,
        now: Instant,
    ) {
        let PendingRequest::CreatePartition { virtual_worker_id, worker } = request else {
            error!("Partition creation response matched an unrelated request");
            return;
        };

        match (status.is_success(), partition_entity_id) {
            (true, Some(partition_entity_id)) => {
                let system_entity_id = worker.system_entity_id;
                self.requests.send_and_register(
                    || connection.send_claim_partition(system_entity_id, partition_entity_id, RetryPolicy::UntilComplete),
                    PendingRequest::ClaimPartition {
                        virtual_worker_id,
                        partition_entity_id,
                        worker,
                    },
                );
            }
            _ => {
                warn!(
                    "Partition creation for virtual worker {} failed ({:?})",
                    virtual_worker_id, status
                );
                self.assigning.remove(&worker.name);
                self.unassigned.insert(virtual_worker_id);
                self.settle(connection, now);
            }
        }
    }

    fn on_partition_claimed(
        &mut self,
        connection: &mut dyn WorkerConnection,
        request: PendingRequest,
        status: &StatusCode,
        now: Instant,
    ) {
        let PendingRequest::ClaimPartition {
            virtual_worker_id,
            partition_entity_id,
            worker,
        } = request
        else {
            error!("Partition claim response matched an unrelated request");
            return;
        };
        self.assigning.remove(&worker.name);

        if !status.is_success() {
            warn!(
                "Claiming partition {} for {} failed ({:?})",
                partition_entity_id, worker.name, status
            );
            self.unassigned.insert(virtual_worker_id);
            self.settle(connection, now);
            return;
        }

        info!(
            "Virtual worker {} bound to {} with partition {}",
            virtual_worker_id, worker.name, partition_entity_id
        );
        self.mapping.insert(
            virtual_worker_id,
            PhysicalWorkerRecord {
                name: worker.name,
                system_entity_id: worker.system_entity_id,
                partition_entity_id,
            },
        );
        self.partitions.push(PartitionInfo {
            partition_entity_id,
            virtual_worker_id,
            simulating_worker_system_entity_id: worker.system_entity_id,
        });
        VIRTUAL_WORKERS_ASSIGNED.set(self.mapping.len() as i64);

        if self.is_complete() {
            self.publish(connection);
        }
        self.settle(connection, now);
    }

    fn on_partition_reclaimed(
        &mut self,
        connection: &mut dyn WorkerConnection,
        request: PendingRequest,
        status: &StatusCode,
        now: Instant,
    ) {
        let PendingRequest::ReclaimPartition {
            virtual_worker_id,
            partition_entity_id,
            worker_name,
        } = request
        else {
            error!("Partition reclaim response matched an unrelated request");
            return;
        };
        self.reclaiming.remove(&virtual_worker_id);

        if !status.is_success() {
            warn!(
                "Reclaiming partition {} from {} failed ({:?})",
                partition_entity_id, worker_name, status
            );
            self.settle(connection, now);
            return;
        }

        self.mapping.remove(&virtual_worker_id);
        self.partitions.retain(|p| p.partition_entity_id != partition_entity_id);
        self.unassigned.insert(virtual_worker_id);
        VIRTUAL_WORKERS_ASSIGNED.set(self.mapping.len() as i64);
        info!(
            "Virtual worker {} freed after {} left",
            virtual_worker_id, worker_name
        );

        self.publish(connection);
        self.settle(connection, now);
    }

    /// With nothing in flight, either rest on a complete mapping or look again
    fn settle(&mut self, connection: &mut dyn WorkerConnection, now: Instant) {
        if !self.requests.is_empty() {
            return;
        }
        if self.is_complete() {
            self.phase = TranslationPhase::Publishing;
        } else {
            debug!(
                "{} of {} virtual workers bound, querying roster again",
                self.mapping.len(),
                self.num_virtual_workers
            );
            self.send_roster_query(connection, now);
        }
    }

    fn publish(&mut self, connection: &mut dyn WorkerConnection) {
        self.generation += 1;
        let snapshot = MappingSnapshot::from_records(self.generation, &self.mapping);
        match snapshot.to_bytes() {
            Ok(payload) => {
                connection.send_component_update(
                    VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID,
                    ComponentUpdate::VirtualWorkerTranslation(payload),
                );
                MAPPING_PUBLISHES.inc();
                info!(
                    "Published virtual worker mapping generation {} with {} entries",
                    self.generation,
                    self.mapping.len()
                );
            }
            Err(e) => error!("Failed to publish virtual worker mapping: {}", e),
        }
    }

    fn in_flight_virtual_workers(&self) -> Vec<VirtualWorkerId> {
        self.requests
            .pending()
            .filter_map(|(_, request)| match request {
                PendingRequest::CreatePartition { virtual_worker_id, .. }
                | PendingRequest::ClaimPartition { virtual_worker_id, .. } => Some(*virtual_worker_id),
                PendingRequest::WorkerQuery | PendingRequest::ReclaimPartition { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_keeps_bound_ids() {
        let mut manager = TranslationManager::new(TranslationManagerConfig::default(), 2);
        manager.mapping.insert(
            1,
            PhysicalWorkerRecord {
                name: "w1".into(),
                system_entity_id: 11,
                partition_entity_id: 21,
            },
        );

        manager.set_number_of_virtual_workers(4);
        assert_eq!(manager.unassigned_virtual_workers().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(!manager.is_complete());

        manager.set_number_of_virtual_workers(1);
        assert_eq!(manager.unassigned_virtual_workers().count(), 0);
        assert!(manager.is_complete());
    }

    #[test]
    fn test_follower_ignores_published_when_authoritative() {
        let mut manager = TranslationManager::new(TranslationManagerConfig::default(), 1);
        manager.authoritative = true;

        let mut records = BTreeMap::new();
        records.insert(
            1,
            PhysicalWorkerRecord {
                name: "w1".into(),
                system_entity_id: 11,
                partition_entity_id: 21,
            },
        );
        manager.observe_published(&MappingSnapshot::from_records(4, &records));

        assert!(manager.mapping().is_empty());
        assert_eq!(manager.generation(), 0);
    }
}
