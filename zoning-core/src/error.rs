//! Error types for zoning
//!
//! Public tick and locking APIs never return these: they log and report a
//! boolean or optional instead. `ZoningError` covers the fallible edges
//! (snapshot encoding, configuration, the loopback runtime).

use thiserror::Error;

/// Primary error type for zoning operations
#[derive(Debug, Error)]
pub enum ZoningError {
    // ========== Mapping Errors ==========

    /// Mapping snapshot could not be encoded or decoded
    #[error("Mapping snapshot codec failed: {reason}")]
    SnapshotCodec { reason: String },

    /// Snapshot was produced by a newer format
    #[error("Mapping snapshot version {found} is newer than supported {supported}")]
    SnapshotVersion { found: u32, supported: u32 },

    /// Snapshot failed validation
    #[error("Mapping snapshot invalid: {reason}")]
    SnapshotInvalid { reason: String },

    // ========== Configuration Errors ==========

    /// Configuration value could not be parsed
    #[error("Invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: String, value: String },

    // ========== Transport Errors ==========

    /// Worker is not connected to the runtime
    #[error("Worker {worker} is not connected")]
    WorkerNotConnected { worker: String },
}

impl ZoningError {
    /// Returns true if retrying the operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZoningError::WorkerNotConnected { .. })
    }
}

/// Result type alias for zoning operations
pub type Result<T> = std::result::Result<T, ZoningError>;
