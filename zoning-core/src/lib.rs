//! Zoning Core - virtual worker partitioning and authority migration
//!
//! This crate splits one simulated world across a fleet of server workers:
//! - Virtual worker to physical worker mapping, replicated as whole snapshots
//! - The single-writer control loop that assigns and reclaims partitions
//! - Per-tick migration decisions against a pluggable placement strategy
//! - Reference-counted migration locks over ownership hierarchies

pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod load_balancing;
pub mod locking;
pub mod metrics;
pub mod strategy;
pub mod translation;
pub mod translator;
pub mod types;
pub mod worker;
pub mod world;

pub use config::ZoningConfig;
pub use error::{Result, ZoningError};
pub use load_balancing::{EvaluationReport, LoadBalancingConfig, LoadBalancingHandler, MigrationIntent};
pub use locking::{LockToken, LockingPolicy, OwnershipLockingPolicy};
pub use strategy::LoadBalanceStrategy;
pub use translation::{TranslationManager, TranslationManagerConfig, TranslationPhase};
pub use translator::VirtualWorkerMap;
pub use types::{EntityId, EntityRef, VirtualWorkerId};
pub use worker::WorkerZoning;
pub use world::{EntityWorld, MigrationBlocker};

/// Default migration cool-down in milliseconds
pub const DEFAULT_MIGRATION_BACKOFF_MS: u64 = 1000;

/// Default roster re-poll interval in milliseconds
pub const DEFAULT_ROSTER_POLL_INTERVAL_MS: u64 = 1000;

/// Default window for repeated migration failure logs in seconds
pub const DEFAULT_MIGRATION_LOG_RATE_SECS: u64 = 5;

/// Default age below which blocked entities are not reported, in milliseconds
pub const DEFAULT_LOG_SUPPRESSION_AGE_MS: u64 = 1000;

/// Default attempts for migration diagnostic requests
pub const DEFAULT_DIAGNOSTIC_RETRY_ATTEMPTS: u32 = 3;

/// Default time an unanswered migration diagnostic stays pending, in milliseconds
pub const DEFAULT_DIAGNOSTIC_TIMEOUT_MS: u64 = 5000;
