//! Random endpoint selection

use std::sync::Arc;

use rand::seq::SliceRandom;

use super::EndpointSelector;
use crate::proxy::circuit::CircuitController;

/// Selects a random endpoint from the candidates
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RandomSelector {
    fn select(&self, candidates: &[Arc<CircuitController>]) -> Option<Arc<CircuitController>> {
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
