//! In-process loopback runtime
//!
//! Simulates the deployment-side half of the transport for tests and the
//! simulation binary. Workers connect by name and get a mailbox of
//! [`WorkerOp`]s; requests are answered immediately by pushing the response
//! into the requesting worker's mailbox, and component updates are broadcast
//! to every connected worker (the sender included). The runtime does not track
//! entity authority, so migration diagnostic requests go to every other worker
//! and the first answer is routed back to the sender.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace};

use crate::connection::component_ids::{SERVER_WORKER_COMPONENT_ID, TRANSLATION_AUTH_COMPONENT_SET_ID};
use crate::connection::ops::{MigrationDiagnostic, StatusCode, WorkerEntityRecord, WorkerOp};
use crate::connection::well_known::VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID;
use crate::connection::{ComponentUpdate, EntityQuery, RetryPolicy, WorkerConnection};
use crate::error::{Result, ZoningError};
use crate::types::{EntityId, RequestId, VirtualWorkerId};

/// First entity id handed out by the loopback runtime
const FIRST_DYNAMIC_ENTITY_ID: EntityId = 100;

/// Connected worker as seen by the runtime
struct WorkerSlot {
    worker_entity_id: EntityId,
    system_entity_id: EntityId,
    ready: bool,
    mailbox: UnboundedSender<WorkerOp>,
}

/// Simulated deployment state
struct RuntimeState {
    next_request_id: RequestId,
    next_entity_id: EntityId,
    workers: BTreeMap<String, WorkerSlot>,
    /// Partition entity -> system entity it is delegated to
    partitions: HashMap<EntityId, Option<EntityId>>,
    intents: HashMap<EntityId, VirtualWorkerId>,
    translation: Option<Bytes>,
    translator_authority: Option<String>,
    failing_queries: u32,
    diagnostics: Vec<(String, EntityId)>,
    /// Open diagnostic request -> worker that sent it
    diagnostic_senders: HashMap<RequestId, String>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            next_request_id: 1,
            next_entity_id: FIRST_DYNAMIC_ENTITY_ID,
            workers: BTreeMap::new(),
            partitions: HashMap::new(),
            intents: HashMap::new(),
            translation: None,
            translator_authority: None,
            failing_queries: 0,
            diagnostics: Vec::new(),
            diagnostic_senders: HashMap::new(),
        }
    }

    fn allocate_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn allocate_entity_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }

    fn deliver(&self, worker: &str, op: WorkerOp) {
        match self.workers.get(worker) {
            Some(slot) => {
                if slot.mailbox.send(op).is_err() {
                    trace!(worker, "Mailbox closed, dropping op");
                }
            }
            None => trace!(worker, "Worker disconnected, dropping op"),
        }
    }

    fn broadcast_except(&self, sender: &str, op: WorkerOp) {
        for (name, slot) in &self.workers {
            if name != sender {
                let _ = slot.mailbox.send(op.clone());
            }
        }
    }

    fn broadcast(&self, op: WorkerOp) {
        for slot in self.workers.values() {
            let _ = slot.mailbox.send(op.clone());
        }
    }
}

/// Shared handle to a simulated deployment
#[derive(Clone)]
pub struct LoopbackRuntime {
    inner: Arc<Mutex<RuntimeState>>,
}

impl LoopbackRuntime {
    /// Create an empty deployment
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RuntimeState::new())),
        }
    }

    /// Connect a worker, returning its connection and op mailbox
    ///
    /// The worker starts not ready; call [`mark_ready`](Self::mark_ready) once
    /// it should appear as ready in roster queries.
    pub fn connect(&self, name: impl Into<String>) -> (LoopbackConnection, UnboundedReceiver<WorkerOp>) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.inner.lock();
        let worker_entity_id = state.allocate_entity_id();
        let system_entity_id = state.allocate_entity_id();
        state.workers.insert(
            name.clone(),
            WorkerSlot {
                worker_entity_id,
                system_entity_id,
                ready: false,
                mailbox: tx,
            },
        );
        info!(worker = %name, system_entity_id, "Worker connected");

        let connection = LoopbackConnection {
            worker_name: name,
            runtime: self.clone(),
        };
        (connection, rx)
    }

    /// Add the readiness tag to a worker entity
    pub fn mark_ready(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let slot = state
            .workers
            .get_mut(name)
            .ok_or_else(|| ZoningError::WorkerNotConnected { worker: name.to_string() })?;
        slot.ready = true;
        debug!(worker = name, "Worker marked ready");
        Ok(())
    }

    /// Remove a worker from the deployment
    pub fn disconnect(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if state.workers.remove(name).is_none() {
            return Err(ZoningError::WorkerNotConnected { worker: name.to_string() });
        }
        if state.translator_authority.as_deref() == Some(name) {
            state.translator_authority = None;
        }
        info!(worker = name, "Worker disconnected");
        Ok(())
    }

    /// Move authority over the mapping entity to `name`
    pub fn delegate_translator_authority(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.workers.contains_key(name) {
            return Err(ZoningError::WorkerNotConnected { worker: name.to_string() });
        }

        if let Some(previous) = state.translator_authority.take() {
            state.deliver(
                &previous,
                WorkerOp::AuthorityChange {
                    entity_id: VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID,
                    component_set_id: TRANSLATION_AUTH_COMPONENT_SET_ID,
                    authoritative: false,
                },
            );
        }
        state.deliver(
            name,
            WorkerOp::AuthorityChange {
                entity_id: VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID,
                component_set_id: TRANSLATION_AUTH_COMPONENT_SET_ID,
                authoritative: true,
            },
        );
        state.translator_authority = Some(name.to_string());
        info!(worker = name, "Translator authority delegated");
        Ok(())
    }

    /// Fail the next `count` entity queries with a timeout
    pub fn fail_next_worker_queries(&self, count: u32) {
        self.inner.lock().failing_queries = count;
    }

    /// System entity id of a connected worker
    pub fn system_entity_id(&self, name: &str) -> Option<EntityId> {
        self.inner.lock().workers.get(name).map(|slot| slot.system_entity_id)
    }

    /// Partition entities currently delegated, as `(partition, system entity)`
    pub fn claimed_partitions(&self) -> Vec<(EntityId, EntityId)> {
        let state = self.inner.lock();
        let mut claims: Vec<_> = state
            .partitions
            .iter()
            .filter_map(|(partition, owner)| owner.map(|owner| (*partition, owner)))
            .collect();
        claims.sort_unstable();
        claims
    }

    /// Last authority intent written for an entity
    pub fn authority_intent(&self, entity_id: EntityId) -> Option<VirtualWorkerId> {
        self.inner.lock().intents.get(&entity_id).copied()
    }

    /// Last mapping snapshot written to the mapping entity
    pub fn latest_translation(&self) -> Option<Bytes> {
        self.inner.lock().translation.clone()
    }

    /// Migration diagnostic requests seen so far, as `(sender, entity)`
    pub fn diagnostic_requests(&self) -> Vec<(String, EntityId)> {
        self.inner.lock().diagnostics.clone()
    }
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's connection to a [`LoopbackRuntime`]
pub struct LoopbackConnection {
    worker_name: String,
    runtime: LoopbackRuntime,
}

impl LoopbackConnection {
    /// Name this connection was opened with
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Runtime this connection belongs to
    pub fn runtime(&self) -> &LoopbackRuntime {
        &self.runtime
    }
}

impl WorkerConnection for LoopbackConnection {
    fn send_entity_query(&mut self, query: EntityQuery, _retry: RetryPolicy) -> RequestId {
        let mut state = self.runtime.inner.lock();
        let request_id = state.allocate_request_id();

        let response = if state.failing_queries > 0 {
            state.failing_queries -= 1;
            WorkerOp::EntityQueryResponse {
                request_id,
                status: StatusCode::Timeout,
                results: Vec::new(),
            }
        } else {
            let results = if query.component == SERVER_WORKER_COMPONENT_ID {
                state
                    .workers
                    .iter()
                    .map(|(name, slot)| WorkerEntityRecord {
                        worker_entity_id: slot.worker_entity_id,
                        name: name.clone(),
                        system_entity_id: slot.system_entity_id,
                        ready: query.readiness_tag.is_none() || slot.ready,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            WorkerOp::EntityQueryResponse {
                request_id,
                status: StatusCode::Success,
                results,
            }
        };

        state.deliver(&self.worker_name, response);
        request_id
    }

    fn send_create_partition(&mut self, virtual_worker_id: VirtualWorkerId, _retry: RetryPolicy) -> RequestId {
        let mut state = self.runtime.inner.lock();
        let request_id = state.allocate_request_id();
        let entity_id = state.allocate_entity_id();
        state.partitions.insert(entity_id, None);
        debug!(virtual_worker_id, partition_entity_id = entity_id, "Partition entity created");

        state.deliver(
            &self.worker_name,
            WorkerOp::CreateEntityResponse {
                request_id,
                status: StatusCode::Success,
                entity_id: Some(entity_id),
            },
        );
        request_id
    }

    fn send_claim_partition(
        &mut self,
        system_entity_id: EntityId,
        partition_entity_id: EntityId,
        _retry: RetryPolicy,
    ) -> RequestId {
        let mut state = self.runtime.inner.lock();
        let request_id = state.allocate_request_id();

        let status = match state.partitions.get_mut(&partition_entity_id) {
            Some(owner) => {
                *owner = Some(system_entity_id);
                StatusCode::Success
            }
            None => StatusCode::NotFound,
        };

        state.deliver(&self.worker_name, WorkerOp::ClaimPartitionResponse { request_id, status });
        request_id
    }

    fn send_reclaim_partition(&mut self, partition_entity_id: EntityId, _retry: RetryPolicy) -> RequestId {
        let mut state = self.runtime.inner.lock();
        let request_id = state.allocate_request_id();

        let status = match state.partitions.get_mut(&partition_entity_id) {
            Some(owner) => {
                *owner = None;
                StatusCode::Success
            }
            None => StatusCode::NotFound,
        };

        state.deliver(&self.worker_name, WorkerOp::ReclaimPartitionResponse { request_id, status });
        request_id
    }

    fn send_component_update(&mut self, entity_id: EntityId, update: ComponentUpdate) {
        let mut state = self.runtime.inner.lock();
        trace!(entity_id, component_id = update.component_id(), "Component update");
        match &update {
            ComponentUpdate::AuthorityIntent(virtual_worker_id) => {
                state.intents.insert(entity_id, *virtual_worker_id);
            }
            ComponentUpdate::VirtualWorkerTranslation(payload) => {
                if entity_id == VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID {
                    state.translation = Some(payload.clone());
                }
            }
        }
        state.broadcast(WorkerOp::ComponentUpdate { entity_id, update });
    }

    fn send_migration_diagnostic(&mut self, entity_id: EntityId, _retry: RetryPolicy) -> RequestId {
        let mut state = self.runtime.inner.lock();
        let request_id = state.allocate_request_id();
        state.diagnostics.push((self.worker_name.clone(), entity_id));
        state.diagnostic_senders.insert(request_id, self.worker_name.clone());
        state.broadcast_except(&self.worker_name, WorkerOp::MigrationDiagnosticRequest { request_id, entity_id });
        request_id
    }

    fn send_migration_diagnostic_response(
        &mut self,
        request_id: RequestId,
        status: StatusCode,
        report: Option<MigrationDiagnostic>,
    ) {
        let mut state = self.runtime.inner.lock();
        let Some(sender) = state.diagnostic_senders.remove(&request_id) else {
            trace!(request_id, "Diagnostic request already answered");
            return;
        };
        state.deliver(
            &sender,
            WorkerOp::MigrationDiagnosticResponse {
                request_id,
                status,
                report,
            },
        );
    }
}

/// Drain every op currently queued in a mailbox without waiting
pub fn drain_ops(mailbox: &mut UnboundedReceiver<WorkerOp>) -> Vec<WorkerOp> {
    let mut ops = Vec::new();
    while let Ok(op) = mailbox.try_recv() {
        ops.push(op);
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_reports_readiness() {
        let runtime = LoopbackRuntime::new();
        let (mut conn, mut rx) = runtime.connect("w1");
        let (_conn2, _rx2) = runtime.connect("w2");
        runtime.mark_ready("w1").unwrap();

        let id = conn.send_entity_query(EntityQuery::server_workers(), RetryPolicy::UntilComplete);
        let ops = drain_ops(&mut rx);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            WorkerOp::EntityQueryResponse { request_id, status, results } => {
                assert_eq!(*request_id, id);
                assert!(status.is_success());
                let ready: Vec<_> = results.iter().map(|r| (r.name.as_str(), r.ready)).collect();
                assert_eq!(ready, vec![("w1", true), ("w2", false)]);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_failed_queries() {
        let runtime = LoopbackRuntime::new();
        let (mut conn, mut rx) = runtime.connect("w1");
        runtime.fail_next_worker_queries(1);

        conn.send_entity_query(EntityQuery::server_workers(), RetryPolicy::UntilComplete);
        conn.send_entity_query(EntityQuery::server_workers(), RetryPolicy::UntilComplete);
        let statuses: Vec<_> = drain_ops(&mut rx)
            .into_iter()
            .filter_map(|op| match op {
                WorkerOp::EntityQueryResponse { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![StatusCode::Timeout, StatusCode::Success]);
    }

    #[test]
    fn test_component_updates_broadcast() {
        let runtime = LoopbackRuntime::new();
        let (mut conn, mut rx1) = runtime.connect("w1");
        let (_conn2, mut rx2) = runtime.connect("w2");

        conn.send_authority_intent(42, 2);
        assert_eq!(runtime.authority_intent(42), Some(2));
        assert_eq!(drain_ops(&mut rx1).len(), 1);
        assert_eq!(drain_ops(&mut rx2).len(), 1);
    }

    #[test]
    fn test_diagnostic_round_trip() {
        let runtime = LoopbackRuntime::new();
        let (mut asker, mut asker_rx) = runtime.connect("w1");
        let (mut owner, mut owner_rx) = runtime.connect("w2");
        let (_bystander, mut bystander_rx) = runtime.connect("w3");

        let id = asker.send_migration_diagnostic(42, RetryPolicy::MaxTimes(3));
        assert!(drain_ops(&mut asker_rx).is_empty());
        let expected = WorkerOp::MigrationDiagnosticRequest {
            request_id: id,
            entity_id: 42,
        };
        assert_eq!(drain_ops(&mut owner_rx), vec![expected.clone()]);
        assert_eq!(drain_ops(&mut bystander_rx), vec![expected]);

        owner.send_migration_diagnostic_response(id, StatusCode::Success, None);
        owner.send_migration_diagnostic_response(id, StatusCode::Success, None);
        let responses = drain_ops(&mut asker_rx);
        assert_eq!(responses.len(), 1, "Only the first answer is delivered");
        assert!(matches!(
            &responses[0],
            WorkerOp::MigrationDiagnosticResponse { request_id, .. } if *request_id == id
        ));
        assert!(drain_ops(&mut owner_rx).is_empty());
    }

    #[test]
    fn test_unknown_worker_rejected() {
        let runtime = LoopbackRuntime::new();
        let err = runtime.mark_ready("ghost").unwrap_err();
        assert!(err.is_retryable());
        assert!(runtime.delegate_translator_authority("ghost").is_err());
    }
}
