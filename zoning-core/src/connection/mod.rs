//! Runtime connection seam
//!
//! The transport and op-dispatch layer is external. The zoning components
//! talk to it through [`WorkerConnection`] (outbound requests and updates) and
//! consume [`WorkerOp`] values (inbound events) drained once per tick.

pub mod loopback;
pub mod ops;

pub use loopback::{drain_ops, LoopbackConnection, LoopbackRuntime};
pub use ops::{MigrationDiagnostic, StatusCode, WorkerEntityRecord, WorkerOp};

use bytes::Bytes;

use crate::types::{ComponentId, EntityId, RequestId, VirtualWorkerId};

/// Well-known entity ids
pub mod well_known {
    use crate::types::EntityId;

    /// Entity carrying the virtual worker translation component
    pub const VIRTUAL_WORKER_TRANSLATOR_ENTITY_ID: EntityId = 3;
}

/// Component and component-set ids understood by the zoning subsystem
pub mod component_ids {
    use crate::types::ComponentId;

    /// Marks an entity as a server worker
    pub const SERVER_WORKER_COMPONENT_ID: ComponentId = 9974;
    /// Tag added by a server worker once it is ready to simulate
    pub const SERVER_WORKER_READY_TAG_ID: ComponentId = 9975;
    /// Virtual worker to physical worker mapping
    pub const VIRTUAL_WORKER_TRANSLATION_COMPONENT_ID: ComponentId = 9979;
    /// Declared target virtual worker of an entity
    pub const AUTHORITY_INTENT_COMPONENT_ID: ComponentId = 9980;
    /// Component set whose authority selects the translation manager
    pub const TRANSLATION_AUTH_COMPONENT_SET_ID: ComponentId = 9901;
}

/// Retry behaviour requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Resend until a definitive response arrives
    UntilComplete,
    /// Give up after this many attempts
    MaxTimes(u32),
}

/// Entity query filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityQuery {
    /// Component every result must carry
    pub component: ComponentId,
    /// Tag reported per result so callers can check readiness
    pub readiness_tag: Option<ComponentId>,
}

impl EntityQuery {
    /// Query for every server worker entity
    pub fn server_workers() -> Self {
        Self {
            component: component_ids::SERVER_WORKER_COMPONENT_ID,
            readiness_tag: Some(component_ids::SERVER_WORKER_READY_TAG_ID),
        }
    }
}

/// Outbound component update
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentUpdate {
    /// New target virtual worker for an entity
    AuthorityIntent(VirtualWorkerId),
    /// Whole serialized virtual worker mapping
    VirtualWorkerTranslation(Bytes),
}

impl ComponentUpdate {
    /// Component id the update is written to
    pub fn component_id(&self) -> ComponentId {
        match self {
            ComponentUpdate::AuthorityIntent(_) => component_ids::AUTHORITY_INTENT_COMPONENT_ID,
            ComponentUpdate::VirtualWorkerTranslation(_) => {
                component_ids::VIRTUAL_WORKER_TRANSLATION_COMPONENT_ID
            }
        }
    }
}

/// Outbound half of a worker's connection to the runtime
///
/// Every request yields exactly one response op carrying the returned
/// `RequestId` (unless the retry policy gives up).
pub trait WorkerConnection {
    /// Query entities matching `query`
    fn send_entity_query(&mut self, query: EntityQuery, retry: RetryPolicy) -> RequestId;

    /// Create a fresh partition entity for a virtual worker
    fn send_create_partition(&mut self, virtual_worker_id: VirtualWorkerId, retry: RetryPolicy) -> RequestId;

    /// Delegate a partition to the worker owning `system_entity_id`
    fn send_claim_partition(
        &mut self,
        system_entity_id: EntityId,
        partition_entity_id: EntityId,
        retry: RetryPolicy,
    ) -> RequestId;

    /// Take a partition back from a departed worker
    fn send_reclaim_partition(&mut self, partition_entity_id: EntityId, retry: RetryPolicy) -> RequestId;

    /// Write a component update on an entity this worker is authoritative for
    fn send_component_update(&mut self, entity_id: EntityId, update: ComponentUpdate);

    /// Ask the authoritative worker of `entity_id` why it keeps authority
    fn send_migration_diagnostic(&mut self, entity_id: EntityId, retry: RetryPolicy) -> RequestId;

    /// Answer a diagnostic request received as [`WorkerOp::MigrationDiagnosticRequest`]
    fn send_migration_diagnostic_response(
        &mut self,
        request_id: RequestId,
        status: StatusCode,
        report: Option<MigrationDiagnostic>,
    );

    /// Declare the virtual worker that should own `entity_id`
    fn send_authority_intent(&mut self, entity_id: EntityId, virtual_worker_id: VirtualWorkerId) {
        self.send_component_update(entity_id, ComponentUpdate::AuthorityIntent(virtual_worker_id));
    }
}
