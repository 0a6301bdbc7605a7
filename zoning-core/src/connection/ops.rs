//! Inbound op types
//!
//! Events the dispatch layer hands to the zoning components each tick.

use crate::connection::ComponentUpdate;
use crate::types::{ComponentId, EntityId, PhysicalWorkerName, RequestId, VirtualWorkerId};
use crate::world::MigrationBlocker;

/// Outcome of a correlated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCode {
    /// Request succeeded
    Success,
    /// Request timed out
    Timeout,
    /// Target entity does not exist
    NotFound,
    /// Authority moved while the request was in flight
    AuthorityLost,
    /// Caller is not allowed to perform the request
    PermissionDenied,
    /// Any other failure, with the runtime's message
    Failure(String),
}

impl StatusCode {
    /// Returns true for a successful response
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

/// One server worker entity returned by a roster query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntityRecord {
    /// Server worker entity
    pub worker_entity_id: EntityId,
    /// Physical worker name
    pub name: PhysicalWorkerName,
    /// System entity of the worker's connection
    pub system_entity_id: EntityId,
    /// Whether the worker carries the readiness tag
    pub ready: bool,
}

/// Report from the authoritative worker of an entity that could not migrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDiagnostic {
    /// Entity the report is about
    pub entity_id: EntityId,
    /// Virtual worker currently holding authority
    pub authoritative_virtual_worker: VirtualWorkerId,
    /// Whether the entity is locked against migration
    pub is_locked: bool,
    /// Hierarchy root of the entity, if it has one
    pub hierarchy_root: Option<EntityId>,
    /// Reason the entity is blocked, if any
    pub blocker: Option<MigrationBlocker>,
}

/// Event delivered by the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOp {
    /// This worker gained or lost authority over a component set
    AuthorityChange {
        entity_id: EntityId,
        component_set_id: ComponentId,
        authoritative: bool,
    },
    /// A component changed on an entity in view
    ComponentUpdate {
        entity_id: EntityId,
        update: ComponentUpdate,
    },
    /// Response to an entity query
    EntityQueryResponse {
        request_id: RequestId,
        status: StatusCode,
        results: Vec<WorkerEntityRecord>,
    },
    /// Response to a partition creation request
    CreateEntityResponse {
        request_id: RequestId,
        status: StatusCode,
        entity_id: Option<EntityId>,
    },
    /// Response to a partition claim request
    ClaimPartitionResponse {
        request_id: RequestId,
        status: StatusCode,
    },
    /// Response to a partition reclaim request
    ReclaimPartitionResponse {
        request_id: RequestId,
        status: StatusCode,
    },
    /// Another worker asks why this worker keeps authority over an entity
    MigrationDiagnosticRequest {
        request_id: RequestId,
        entity_id: EntityId,
    },
    /// Response to a migration diagnostic request
    MigrationDiagnosticResponse {
        request_id: RequestId,
        status: StatusCode,
        report: Option<MigrationDiagnostic>,
    },
}
