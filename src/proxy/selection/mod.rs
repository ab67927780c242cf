//! Endpoint selection strategies
//!
//! The pool hands a selector the current candidate tier; the selector picks
//! one endpoint. Load-aware selectors also track leases in flight.

mod least_conn;
mod random;
mod round_robin;

pub use least_conn::LeastConnectionsSelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::Arc;

use super::circuit::CircuitController;

/// Load-balancing policy of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

impl SelectionStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "least_connections" | "leastconnections" | "least-connections" | "least_conn" => {
                Some(Self::LeastConnections)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastConnections => "least_connections",
        }
    }
}

/// Picks an endpoint from a candidate tier
///
/// Selection never blocks; it works from the snapshot it is given.
pub trait EndpointSelector: Send + Sync {
    /// Pick one of `candidates`, or `None` when the slice is empty
    fn select(&self, candidates: &[Arc<CircuitController>]) -> Option<Arc<CircuitController>>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;

    /// Mark an endpoint as leased; only load-aware strategies track this
    fn acquire(&self, _endpoint_id: usize) {}

    /// Mark a lease as returned
    fn release(&self, _endpoint_id: usize) {}
}

/// Leases in flight per endpoint
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: dashmap::DashMap<usize, usize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: dashmap::DashMap::new(),
        }
    }

    pub fn acquire(&self, endpoint_id: usize) {
        self.connections
            .entry(endpoint_id)
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn release(&self, endpoint_id: usize) {
        self.connections.entry(endpoint_id).and_modify(|c| {
            if *c > 0 {
                *c -= 1;
            }
        });
    }

    pub fn get(&self, endpoint_id: usize) -> usize {
        self.connections.get(&endpoint_id).map(|v| *v).unwrap_or(0)
    }
}

/// Create an endpoint selector for the strategy
pub fn create_selector(strategy: SelectionStrategy) -> Arc<dyn EndpointSelector> {
    match strategy {
        SelectionStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
        SelectionStrategy::Random => Arc::new(RandomSelector::new()),
        SelectionStrategy::LeastConnections => Arc::new(LeastConnectionsSelector::new()),
    }
}
