//! Per-tick migration decisions
//!
//! Evaluates locally authoritative entities against the placement strategy
//! and the locking policy, then applies every queued migration as one batch.

pub mod failure_log;
pub mod handler;

pub use failure_log::MigrationFailureLog;
pub use handler::{EntityEvaluation, LoadBalancingHandler};

use std::time::Duration;

use crate::types::{EntityRef, VirtualWorkerId};
use crate::{
    DEFAULT_DIAGNOSTIC_RETRY_ATTEMPTS, DEFAULT_DIAGNOSTIC_TIMEOUT_MS, DEFAULT_LOG_SUPPRESSION_AGE_MS,
    DEFAULT_MIGRATION_BACKOFF_MS, DEFAULT_MIGRATION_LOG_RATE_SECS,
};

/// Configuration for the migration engine
#[derive(Debug, Clone)]
pub struct LoadBalancingConfig {
    /// Minimum time a hierarchy must stay put after receiving authority
    pub migration_backoff: Duration,
    /// Window after which repeated migration failures are logged again
    pub failure_log_rate: Duration,
    /// Entities younger than this are not reported when blocked
    pub log_suppression_age: Duration,
    /// Attempts for best-effort migration diagnostic requests
    pub diagnostic_retry_attempts: u32,
    /// Unanswered diagnostic requests are dropped after this long
    pub diagnostic_timeout: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            migration_backoff: Duration::from_millis(DEFAULT_MIGRATION_BACKOFF_MS),
            failure_log_rate: Duration::from_secs(DEFAULT_MIGRATION_LOG_RATE_SECS),
            log_suppression_age: Duration::from_millis(DEFAULT_LOG_SUPPRESSION_AGE_MS),
            diagnostic_retry_attempts: DEFAULT_DIAGNOSTIC_RETRY_ATTEMPTS,
            diagnostic_timeout: Duration::from_millis(DEFAULT_DIAGNOSTIC_TIMEOUT_MS),
        }
    }
}

/// Entity queued to move to another virtual worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationIntent {
    /// Migrating entity
    pub entity: EntityRef,
    /// Destination virtual worker
    pub target_virtual_worker_id: VirtualWorkerId,
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    /// Intents sent this pass, in entity order
    pub applied: Vec<MigrationIntent>,
    /// Hierarchy members that migrated without being candidates themselves
    pub additional: Vec<EntityRef>,
}
