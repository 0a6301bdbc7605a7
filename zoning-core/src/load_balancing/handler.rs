//! Load balancing handler
//!
//! Decides, once per tick, which locally authoritative entities must move and
//! where. A decision always covers the whole ownership hierarchy of the
//! entity's net owner, and the queued intents are applied together at the end
//! of the pass.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{MigrationDiagnostic, RetryPolicy, StatusCode, WorkerConnection};
use crate::correlator::RequestCorrelator;
use crate::load_balancing::{EvaluationReport, LoadBalancingConfig, MigrationFailureLog, MigrationIntent};
use crate::locking::LockingPolicy;
use crate::metrics::standard::{
    BLOCKED_HIERARCHIES, DIAGNOSTICS_EXPIRED, EVALUATION_DURATION, MIGRATIONS_APPLIED, MIGRATIONS_DEFERRED,
    MIGRATION_REJECTIONS,
};
use crate::strategy::LoadBalanceStrategy;
use crate::types::{
    is_valid_virtual_worker, AuthorityRole, EntityId, EntityRef, RequestId, VirtualWorkerId,
    INVALID_VIRTUAL_WORKER_ID,
};
use crate::world::{hierarchy_root, topmost_owner, EntityWorld, MigrationBlocker};

/// Verdict for a single candidate entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvaluation {
    /// Nothing to do
    None,
    /// Should move, but its hierarchy received authority too recently
    Deferred,
    /// Already queued through its hierarchy this pass
    RemoveAdditional,
    /// Move the hierarchy of `net_owner` to `target`
    Migrate {
        net_owner: EntityRef,
        target: VirtualWorkerId,
    },
}

/// Diagnostic request awaiting its response
#[derive(Debug, Clone, Copy)]
struct PendingDiagnostic {
    entity_id: EntityId,
    sent_at: Instant,
}

/// Per-worker migration decision engine
pub struct LoadBalancingHandler {
    config: LoadBalancingConfig,
    pending: BTreeMap<EntityRef, VirtualWorkerId>,
    failure_log: MigrationFailureLog,
    diagnostics: RequestCorrelator<PendingDiagnostic>,
}

impl LoadBalancingHandler {
    /// Create a handler
    pub fn new(config: LoadBalancingConfig) -> Self {
        let failure_log = MigrationFailureLog::new(config.failure_log_rate);
        Self {
            config,
            pending: BTreeMap::new(),
            failure_log,
            diagnostics: RequestCorrelator::new(),
        }
    }

    /// Handler configuration
    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// Intents queued in the current pass
    pub fn pending_migrations(&self) -> &BTreeMap<EntityRef, VirtualWorkerId> {
        &self.pending
    }

    /// Diagnostic requests still awaiting a response
    pub fn pending_diagnostics(&self) -> usize {
        self.diagnostics.len()
    }

    /// Run one full pass: evaluate every candidate, then apply the batch
    pub fn evaluate(
        &mut self,
        world: &mut dyn EntityWorld,
        strategy: &dyn LoadBalanceStrategy,
        locks: &dyn LockingPolicy,
        connection: &mut dyn WorkerConnection,
        candidates: &[EntityRef],
        now: Instant,
    ) -> EvaluationReport {
        let started = Instant::now();
        self.expire_diagnostics(now);
        let additional = self.evaluate_entities_to_migrate(&*world, strategy, locks, connection, candidates, now);
        let applied = self.process_migrations(world, connection);
        EVALUATION_DURATION.observe_since(started);

        EvaluationReport { applied, additional }
    }

    /// Drop diagnostic requests that went unanswered for longer than the timeout
    ///
    /// Requests sent with a bounded retry policy may never get a response.
    /// Returns how many were dropped.
    pub fn expire_diagnostics(&mut self, now: Instant) -> usize {
        let timeout = self.config.diagnostic_timeout;
        let expired: Vec<RequestId> = self
            .diagnostics
            .pending()
            .filter(|(_, pending)| now.saturating_duration_since(pending.sent_at) >= timeout)
            .map(|(request_id, _)| *request_id)
            .collect();

        for request_id in &expired {
            if let Some(pending) = self.diagnostics.take(*request_id) {
                debug!(
                    "Migration diagnostic request {} for entity {} expired unanswered",
                    request_id, pending.entity_id
                );
            }
        }
        DIAGNOSTICS_EXPIRED.inc_by(expired.len() as u64);
        expired.len()
    }

    /// Evaluate candidates and queue migration intents
    ///
    /// Returns hierarchy members queued alongside a candidate that the host
    /// must also process this tick.
    pub fn evaluate_entities_to_migrate(
        &mut self,
        world: &dyn EntityWorld,
        strategy: &dyn LoadBalanceStrategy,
        locks: &dyn LockingPolicy,
        connection: &mut dyn WorkerConnection,
        candidates: &[EntityRef],
        now: Instant,
    ) -> Vec<EntityRef> {
        let mut additional: Vec<EntityRef> = Vec::new();

        for &entity in candidates {
            match self.evaluate_single_entity(world, strategy, locks, entity, now) {
                EntityEvaluation::Migrate { net_owner, target } => {
                    let net_owner_local = world.has_authority(net_owner);
                    let mut hierarchy = Vec::new();
                    match collect_hierarchy(world, net_owner, net_owner_local, &mut hierarchy) {
                        Ok(()) => {
                            for member in hierarchy {
                                self.pending.insert(member, target);
                                if member != entity && !additional.contains(&member) {
                                    additional.push(member);
                                }
                            }
                        }
                        Err((blocked, blocker)) => {
                            BLOCKED_HIERARCHIES.inc();
                            self.log_migration_failure(world, connection, net_owner, blocked, blocker, now);
                        }
                    }
                }
                EntityEvaluation::RemoveAdditional => additional.retain(|e| *e != entity),
                EntityEvaluation::None | EntityEvaluation::Deferred => {}
            }
        }

        additional
    }

    /// Decide what to do with one candidate entity
    pub fn evaluate_single_entity(
        &self,
        world: &dyn EntityWorld,
        strategy: &dyn LoadBalanceStrategy,
        locks: &dyn LockingPolicy,
        entity: EntityRef,
        now: Instant,
    ) -> EntityEvaluation {
        let Some(entity_id) = world.entity_id(entity) else {
            return EntityEvaluation::None;
        };
        if !world.has_authority(entity) {
            return EntityEvaluation::None;
        }

        // Its hierarchy was already processed when it was first queued
        if self.pending.contains_key(&entity) {
            return EntityEvaluation::RemoveAdditional;
        }

        let net_owner = hierarchy_root(world, entity);

        if let Some(target) = world.remote_migration_target(entity) {
            if locks.is_locked(world, entity) {
                trace!("{} ({}) cannot migrate because it is locked", entity, entity_id);
                return EntityEvaluation::None;
            }
            let target_root = hierarchy_root(world, target);
            let target_worker = virtual_worker_of(world, strategy, target_root);
            if is_valid_virtual_worker(target_worker) {
                trace!("Handing off {} to virtual worker {}", net_owner, target_worker);
                return EntityEvaluation::Migrate {
                    net_owner,
                    target: target_worker,
                };
            }
            error!(
                "Load balancing strategy returned invalid virtual worker for hand-off target {}",
                target
            );
        }

        let net_owner_has_authority = world.has_authority(net_owner);
        let should_have_authority = strategy.should_have_authority(net_owner);

        // Stay if we belong here and are not separated from our owner
        if should_have_authority && net_owner_has_authority {
            return EntityEvaluation::None;
        }
        if locks.is_locked(world, entity) {
            trace!("{} ({}) cannot migrate because it is locked", entity, entity_id);
            return EntityEvaluation::None;
        }

        if let Some(received) = latest_authority_change(world, net_owner) {
            if now.saturating_duration_since(received) < self.config.migration_backoff {
                trace!("Tried to change authority too early for {}", entity);
                MIGRATIONS_DEFERRED.inc();
                return EntityEvaluation::Deferred;
            }
        }

        let target = if net_owner_has_authority {
            strategy.who_should_have_authority(net_owner)
        } else {
            // Follow the owner's declared destination rather than a strategy
            // answer the owner may not have acted on yet
            match world.authority_intent(net_owner) {
                Some(intent) => intent,
                None => {
                    error!(
                        "{} ({}) cannot join its owner {} ({:?})",
                        entity,
                        entity_id,
                        net_owner,
                        world.entity_id(net_owner)
                    );
                    INVALID_VIRTUAL_WORKER_ID
                }
            }
        };

        if !is_valid_virtual_worker(target) {
            error!("Load balancing strategy returned invalid virtual worker for {}", entity);
            MIGRATION_REJECTIONS.inc();
            return EntityEvaluation::None;
        }
        if !should_have_authority && strategy.local_virtual_worker_id() == Some(target) {
            error!(
                "should_have_authority returned false for {}, but who_should_have_authority returned this worker's id. \
                 Entity will not be migrated.",
                entity
            );
            MIGRATION_REJECTIONS.inc();
            return EntityEvaluation::None;
        }

        EntityEvaluation::Migrate { net_owner, target }
    }

    /// Apply every queued intent and clear the queue
    pub fn process_migrations(
        &mut self,
        world: &mut dyn EntityWorld,
        connection: &mut dyn WorkerConnection,
    ) -> Vec<MigrationIntent> {
        let pending = std::mem::take(&mut self.pending);
        let mut applied = Vec::with_capacity(pending.len());

        for (entity, target) in pending {
            let Some(entity_id) = world.entity_id(entity) else {
                warn!("Dropping migration of {}: it no longer has a runtime id", entity);
                continue;
            };

            connection.send_authority_intent(entity_id, target);
            world.set_role(entity, AuthorityRole::SimulatedProxy);
            world.on_authority_lost(entity);

            applied.push(MigrationIntent {
                entity,
                target_virtual_worker_id: target,
            });
        }

        if !applied.is_empty() {
            MIGRATIONS_APPLIED.inc_by(applied.len() as u64);
            debug!("Sent {} authority intents", applied.len());
        }
        applied
    }

    /// Build the report this worker answers a migration diagnostic with
    pub fn diagnose(
        world: &dyn EntityWorld,
        locks: &dyn LockingPolicy,
        local_virtual_worker_id: Option<VirtualWorkerId>,
        entity: EntityRef,
    ) -> Option<MigrationDiagnostic> {
        let entity_id = world.entity_id(entity)?;
        Some(MigrationDiagnostic {
            entity_id,
            authoritative_virtual_worker: local_virtual_worker_id.unwrap_or(INVALID_VIRTUAL_WORKER_ID),
            is_locked: locks.is_locked(world, entity),
            hierarchy_root: topmost_owner(world, entity).and_then(|root| world.entity_id(root)),
            blocker: world.migration_readiness(entity).err(),
        })
    }

    /// Handle the response to a diagnostic request this handler sent
    ///
    /// Returns false for responses it did not ask for.
    pub fn on_diagnostic_response(
        &mut self,
        request_id: RequestId,
        status: &StatusCode,
        report: Option<&MigrationDiagnostic>,
    ) -> bool {
        let Some(PendingDiagnostic { entity_id, .. }) = self.diagnostics.take(request_id) else {
            return false;
        };

        match (status.is_success(), report) {
            (true, Some(report)) => {
                let reason = report
                    .blocker
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "has no blocker".to_string());
                info!(
                    "Migration diagnostic for entity {}: authoritative on virtual worker {}, locked={}, hierarchy root {:?}, {}",
                    entity_id, report.authoritative_virtual_worker, report.is_locked, report.hierarchy_root, reason
                );
            }
            _ => warn!(
                "Migration diagnostic request for entity {} failed: {:?}",
                entity_id, status
            ),
        }
        true
    }

    fn log_migration_failure(
        &mut self,
        world: &dyn EntityWorld,
        connection: &mut dyn WorkerConnection,
        net_owner: EntityRef,
        blocked: EntityRef,
        blocker: MigrationBlocker,
        now: Instant,
    ) {
        // Freshly created entities are routinely not ready yet
        if world.time_since_creation(blocked, now) <= self.config.log_suppression_age {
            return;
        }
        let Some(entity_id) = world.entity_id(blocked) else {
            return;
        };
        if !self.failure_log.should_log(entity_id, blocker, now) {
            return;
        }

        if blocker == MigrationBlocker::NotAuthoritative {
            let attempts = self.config.diagnostic_retry_attempts;
            let request_id = connection.send_migration_diagnostic(entity_id, RetryPolicy::MaxTimes(attempts));
            self.diagnostics
                .register(request_id, PendingDiagnostic { entity_id, sent_at: now });
            debug!("Requested migration diagnostic for entity {}", entity_id);
        } else {
            warn!(
                "Prevented {}'s hierarchy from migrating because {} ({}) {}",
                net_owner, blocked, entity_id, blocker
            );
        }
    }
}

/// Virtual worker an entity is on or is heading to
fn virtual_worker_of(world: &dyn EntityWorld, strategy: &dyn LoadBalanceStrategy, entity: EntityRef) -> VirtualWorkerId {
    if world.has_authority(entity) {
        strategy.who_should_have_authority(entity)
    } else {
        world.authority_intent(entity).unwrap_or(INVALID_VIRTUAL_WORKER_ID)
    }
}

/// Most recent authority gain over a hierarchy's replicated, owned members
fn latest_authority_change(world: &dyn EntityWorld, root: EntityRef) -> Option<Instant> {
    let mut latest: Option<Instant> = None;
    let mut visited = HashSet::new();
    let mut stack = vec![root];

    while let Some(entity) = stack.pop() {
        if !visited.insert(entity) {
            continue;
        }
        stack.extend(world.children(entity));

        if world.is_replicated(entity) && world.has_authority(entity) {
            if let Some(at) = world.authority_received_at(entity) {
                latest = Some(latest.map_or(at, |l| l.max(at)));
            }
        }
    }
    latest
}

/// Gather every member that must move with `root`
///
/// Fails with the first blocked member. When the root is not owned here,
/// members owned elsewhere are skipped instead of blocking.
fn collect_hierarchy(
    world: &dyn EntityWorld,
    root: EntityRef,
    root_local: bool,
    out: &mut Vec<EntityRef>,
) -> Result<(), (EntityRef, MigrationBlocker)> {
    let mut visited = HashSet::new();
    let mut stack = vec![root];

    while let Some(entity) = stack.pop() {
        if !visited.insert(entity) {
            continue;
        }

        let readiness = if world.entity_id(entity).is_none() {
            Err(MigrationBlocker::NotInitialized)
        } else {
            world.migration_readiness(entity)
        };

        match readiness {
            Ok(()) => out.push(entity),
            Err(MigrationBlocker::NotAuthoritative) if !root_local => {}
            Err(blocker) => return Err((entity, blocker)),
        }

        let mut next: Vec<EntityRef> = world
            .children(entity)
            .into_iter()
            .filter(|child| world.is_replicated(*child))
            .collect();
        next.extend(world.dependents(entity));
        // Reverse so members are visited in host order
        stack.extend(next.into_iter().rev());
    }
    Ok(())
}
