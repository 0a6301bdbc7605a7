//! Placement strategy seam
//!
//! The strategy decides which virtual worker should own an entity. Zoning
//! only asks; it never balances load itself.

use crate::types::{EntityRef, VirtualWorkerId};

/// Injected placement strategy
pub trait LoadBalanceStrategy {
    /// Whether the strategy can answer placement questions yet
    fn is_ready(&self) -> bool;

    /// Virtual worker this process simulates, once known
    fn local_virtual_worker_id(&self) -> Option<VirtualWorkerId>;

    /// Called when the mapping assigns this process a virtual worker
    fn set_local_virtual_worker_id(&mut self, virtual_worker_id: VirtualWorkerId);

    /// Whether this process should be authoritative over `entity`
    fn should_have_authority(&self, entity: EntityRef) -> bool;

    /// Virtual worker that should be authoritative over `entity`
    ///
    /// May return the invalid id when the strategy has no answer.
    fn who_should_have_authority(&self, entity: EntityRef) -> VirtualWorkerId;

    /// Number of virtual workers the strategy needs
    fn minimum_required_workers(&self) -> u32;
}
