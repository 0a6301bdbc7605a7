//! Per-process zoning facade
//!
//! Owns every zoning component of one worker. The host drains its op mailbox
//! into [`WorkerZoning::process_ops`] and calls [`WorkerZoning::tick`] once
//! per simulation tick.

use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ZoningConfig;
use crate::connection::well_known::VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID;
use crate::connection::{ComponentUpdate, MigrationDiagnostic, StatusCode, WorkerConnection, WorkerOp};
use crate::load_balancing::{EvaluationReport, LoadBalancingHandler};
use crate::locking::{LockToken, LockingPolicy, OwnershipLockingPolicy};
use crate::strategy::LoadBalanceStrategy;
use crate::translation::TranslationManager;
use crate::translator::{MappingSnapshot, VirtualWorkerMap};
use crate::types::{EntityId, EntityRef, RequestId};
use crate::world::EntityWorld;

/// Zoning state of one worker process
pub struct WorkerZoning<C, S> {
    connection: C,
    strategy: S,
    map: VirtualWorkerMap,
    manager: TranslationManager,
    locks: OwnershipLockingPolicy,
    handler: LoadBalancingHandler,
    /// Diagnostic requests received since the last tick
    diagnostic_requests: Vec<(RequestId, EntityId)>,
}

impl<C, S> WorkerZoning<C, S>
where
    C: WorkerConnection,
    S: LoadBalanceStrategy,
{
    /// Wire up a worker; the strategy decides how many virtual workers exist
    pub fn new(config: ZoningConfig, connection: C, strategy: S) -> Self {
        let manager = TranslationManager::new(config.translation, strategy.minimum_required_workers());
        Self {
            connection,
            strategy,
            map: VirtualWorkerMap::new(config.worker_name),
            manager,
            locks: OwnershipLockingPolicy::new(),
            handler: LoadBalancingHandler::new(config.load_balancing),
            diagnostic_requests: Vec::new(),
        }
    }

    /// Route inbound ops; returns the ops zoning does not consume
    pub fn process_ops<I>(&mut self, ops: I, now: Instant) -> Vec<WorkerOp>
    where
        I: IntoIterator<Item = WorkerOp>,
    {
        let mut unhandled = Vec::new();

        for op in ops {
            if self.manager.handle_op(&mut self.connection, &op, now) {
                continue;
            }

            let consumed = match &op {
                WorkerOp::ComponentUpdate {
                    entity_id,
                    update: ComponentUpdate::VirtualWorkerTranslation(payload),
                } if *entity_id == VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID => {
                    self.apply_mapping(payload);
                    true
                }
                WorkerOp::MigrationDiagnosticResponse {
                    request_id,
                    status,
                    report,
                } => self.handler.on_diagnostic_response(*request_id, status, report.as_ref()),
                WorkerOp::MigrationDiagnosticRequest { request_id, entity_id } => {
                    self.diagnostic_requests.push((*request_id, *entity_id));
                    true
                }
                _ => false,
            };

            if !consumed {
                unhandled.push(op);
            }
        }

        unhandled
    }

    /// One simulation tick: control loop upkeep, diagnostic answers, then one migration pass
    pub fn tick(&mut self, world: &mut dyn EntityWorld, candidates: &[EntityRef], now: Instant) -> EvaluationReport {
        self.manager.poll(&mut self.connection, now);
        self.answer_diagnostic_requests(&*world);

        if !self.map.is_ready() || !self.strategy.is_ready() {
            return EvaluationReport::default();
        }

        self.handler.evaluate(
            world,
            &self.strategy,
            &self.locks,
            &mut self.connection,
            candidates,
            now,
        )
    }

    /// Report why an entity this worker owns keeps its authority
    pub fn answer_migration_diagnostic(&self, world: &dyn EntityWorld, entity: EntityRef) -> Option<MigrationDiagnostic> {
        LoadBalancingHandler::diagnose(world, &self.locks, self.map.local_virtual_worker_id(), entity)
    }

    /// Diagnostic requests waiting for the next tick
    pub fn queued_diagnostic_requests(&self) -> usize {
        self.diagnostic_requests.len()
    }

    /// Lock an entity against migration
    pub fn acquire_lock(&mut self, world: &dyn EntityWorld, entity: EntityRef, debug_label: &str) -> LockToken {
        self.locks.acquire_lock(world, entity, debug_label)
    }

    /// Release a lock token
    pub fn release_lock(&mut self, token: LockToken) -> bool {
        self.locks.release_lock(token)
    }

    /// Whether an entity is locked against migration
    pub fn is_locked(&self, world: &dyn EntityWorld, entity: EntityRef) -> bool {
        self.locks.is_locked(world, entity)
    }

    /// Forward an owner change from the host
    pub fn on_owner_updated(&mut self, world: &dyn EntityWorld, entity: EntityRef, old_owner: Option<EntityRef>) {
        self.locks.on_owner_updated(world, entity, old_owner);
    }

    /// Forward a destruction from the host
    pub fn on_entity_destroyed(&mut self, world: &dyn EntityWorld, entity: EntityRef) {
        if self.locks.is_watching(entity) {
            self.locks.on_entity_destroyed(world, entity);
        }
    }

    /// Follower view of the virtual worker mapping
    pub fn map(&self) -> &VirtualWorkerMap {
        &self.map
    }

    /// Translation manager, active only while authoritative over the mapping
    pub fn manager(&self) -> &TranslationManager {
        &self.manager
    }

    /// Migration locks held by this worker
    pub fn locks(&self) -> &OwnershipLockingPolicy {
        &self.locks
    }

    /// Mutable access to the migration locks
    pub fn locks_mut(&mut self) -> &mut OwnershipLockingPolicy {
        &mut self.locks
    }

    /// Migration decision engine
    pub fn handler(&self) -> &LoadBalancingHandler {
        &self.handler
    }

    /// Runtime connection
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Mutable access to the runtime connection
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Placement strategy
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Mutable access to the placement strategy
    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// Answer requests for entities this worker is authoritative over
    ///
    /// Other requests are left to the worker that owns the entity; the asker
    /// drops them once its timeout elapses.
    fn answer_diagnostic_requests(&mut self, world: &dyn EntityWorld) {
        for (request_id, entity_id) in std::mem::take(&mut self.diagnostic_requests) {
            let report = world
                .entity_by_id(entity_id)
                .filter(|entity| world.has_authority(*entity))
                .and_then(|entity| self.answer_migration_diagnostic(world, entity));

            match report {
                Some(report) => {
                    debug!("Answering migration diagnostic for entity {}", entity_id);
                    self.connection
                        .send_migration_diagnostic_response(request_id, StatusCode::Success, Some(report));
                }
                None => trace!("Not authoritative over entity {}, ignoring diagnostic request", entity_id),
            }
        }
    }

    fn apply_mapping(&mut self, payload: &[u8]) {
        let snapshot = match MappingSnapshot::from_bytes(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring undecodable virtual worker mapping: {}", e);
                return;
            }
        };
        if !self.map.apply_snapshot(&snapshot) {
            return;
        }

        if let Some(virtual_worker_id) = self.map.take_local_virtual_worker_change() {
            debug!(
                "{} now simulates virtual worker {}",
                self.map.local_physical_worker_name(),
                virtual_worker_id
            );
            self.strategy.set_local_virtual_worker_id(virtual_worker_id);
        }
        self.manager.observe_published(&snapshot);
    }
}
