//! Round-robin endpoint selection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::EndpointSelector;
use crate::proxy::circuit::CircuitController;

/// Selects endpoints in round-robin order
///
/// Uses an atomic counter, so concurrent callers never wait on each other.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, candidates: &[Arc<CircuitController>]) -> Option<Arc<CircuitController>> {
        if candidates.is_empty() {
            return None;
        }

        let idx = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_controllers;

    #[test]
    fn test_round_robin_empty() {
        let selector = RoundRobinSelector::new();
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn test_round_robin_order() {
        let selector = RoundRobinSelector::new();
        let endpoints = test_controllers(3);

        let ids: Vec<usize> = (0..6)
            .map(|_| selector.select(&endpoints).unwrap().id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }
}
