//! Pool of proxy endpoints

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, info};

use super::circuit::CircuitController;
use super::control::{ControlAuth, TorControlChannel};
use super::selection::{create_selector, EndpointSelector};
use crate::config::Config;
use crate::error::{FetchError, Result};
use crate::models::{EndpointState, FailureKind, PoolHealth};

/// Result of one attempt made through a leased endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(FailureKind),
    /// Cut short by batch cancellation; counts as a request only
    Abandoned,
}

/// Owns the circuit controllers and assigns endpoints to requests
pub struct ProxyPool {
    controllers: Vec<Arc<CircuitController>>,
    selector: Arc<dyn EndpointSelector>,
}

impl ProxyPool {
    pub fn new(
        controllers: Vec<Arc<CircuitController>>,
        selector: Arc<dyn EndpointSelector>,
    ) -> Result<Self> {
        if controllers.is_empty() {
            return Err(FetchError::InvalidConfig(
                "proxy pool needs at least one endpoint".into(),
            ));
        }

        Ok(Self {
            controllers,
            selector,
        })
    }

    /// Build one controller per configured Tor instance
    pub fn from_config(config: &Config) -> Result<Self> {
        let auth = match (&config.tor.control_password, &config.tor.cookie_path) {
            (Some(password), _) => ControlAuth::Password(password.clone()),
            (None, Some(path)) => ControlAuth::Cookie(path.clone()),
            (None, None) => ControlAuth::Auto,
        };

        let controllers = config
            .tor
            .endpoints()
            .into_iter()
            .map(|address| {
                let channel = TorControlChannel::new(
                    address.control_address.clone(),
                    auth.clone(),
                    config.tor.control_timeout,
                );
                Arc::new(CircuitController::new(
                    address,
                    Arc::new(channel),
                    config.rotation,
                    config.tor.dead_after,
                    config.tor.settle_delay,
                ))
            })
            .collect::<Vec<_>>();

        info!(
            endpoints = controllers.len(),
            strategy = config.pool.selection_strategy.as_str(),
            interval = config.rotation.interval,
            rotate_on_error = config.rotation.rotate_on_error,
            "Proxy pool initialized"
        );

        Self::new(controllers, create_selector(config.pool.selection_strategy))
    }

    /// Lease an endpoint for one task
    ///
    /// Picks from `Starting`/`Healthy` endpoints, falls back to `Degraded`
    /// ones, and fails only when every endpoint is `Dead`.
    pub fn acquire(&self) -> Result<Lease> {
        let preferred = self.tier(EndpointState::is_preferred);
        let candidates = if preferred.is_empty() {
            self.tier(|state| *state == EndpointState::Degraded)
        } else {
            preferred
        };

        let controller = self
            .selector
            .select(&candidates)
            .ok_or(FetchError::PoolExhausted)?;
        self.selector.acquire(controller.id());

        debug!(endpoint = controller.id(), state = %controller.state(), "Endpoint leased");

        Ok(Lease {
            controller,
            selector: Arc::clone(&self.selector),
        })
    }

    fn tier(&self, include: impl Fn(&EndpointState) -> bool) -> Vec<Arc<CircuitController>> {
        self.controllers
            .iter()
            .filter(|c| include(&c.state()))
            .cloned()
            .collect()
    }

    /// Report the outcome of one attempt to the endpoint's controller
    pub fn release(&self, controller: &Arc<CircuitController>, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Success => {
                controller.record_success();
                controller.record_request();
            }
            AttemptOutcome::Failure(kind) => {
                controller.record_request();
                controller.record_error(kind);
            }
            AttemptOutcome::Abandoned => controller.record_request(),
        }
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth::from_endpoints(self.controllers.iter().map(|c| c.snapshot()).collect())
    }

    pub fn controllers(&self) -> &[Arc<CircuitController>] {
        &self.controllers
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.selector.strategy_name()
    }
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("endpoints", &self.controllers.len())
            .field("strategy", &self.selector.strategy_name())
            .finish()
    }
}

/// An endpoint held by one task
///
/// Dropping the lease, including when the task is cancelled, frees its
/// connection-tracking slot.
pub struct Lease {
    controller: Arc<CircuitController>,
    selector: Arc<dyn EndpointSelector>,
}

impl Lease {
    pub fn controller(&self) -> &Arc<CircuitController> {
        &self.controller
    }
}

impl Deref for Lease {
    type Target = CircuitController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.selector.release(self.controller.id());
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.controller.id())
            .finish()
    }
}
