//! Least-connections endpoint selection

use std::sync::Arc;

use super::{ConnectionTracker, EndpointSelector};
use crate::proxy::circuit::CircuitController;

/// Selects the endpoint with the fewest leases in flight
///
/// Ties go to the endpoint listed first.
pub struct LeastConnectionsSelector {
    tracker: ConnectionTracker,
}

impl LeastConnectionsSelector {
    pub fn new() -> Self {
        Self {
            tracker: ConnectionTracker::new(),
        }
    }
}

impl Default for LeastConnectionsSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for LeastConnectionsSelector {
    fn select(&self, candidates: &[Arc<CircuitController>]) -> Option<Arc<CircuitController>> {
        candidates
            .iter()
            .min_by_key(|endpoint| self.tracker.get(endpoint.id()))
            .cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "least_connections"
    }

    fn acquire(&self, endpoint_id: usize) {
        self.tracker.acquire(endpoint_id);
    }

    fn release(&self, endpoint_id: usize) {
        self.tracker.release(endpoint_id);
    }
}
