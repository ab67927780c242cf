//! Circuit lifecycle of one proxy endpoint

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::control::ControlChannel;
use crate::error::RotationError;
use crate::models::{
    EndpointAddress, EndpointState, ExitNode, FailureKind, IdentityInfo, ProxyEndpoint,
    RotationPolicy,
};

#[derive(Debug, Default)]
struct ControllerStatus {
    state: EndpointState,
    last_rotated_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    exit_node: Option<ExitNode>,
}

/// Owns the control channel of one endpoint and tracks its circuit
///
/// All endpoint mutation goes through this type. Rotations are serialized,
/// and triggers that arrive while one is running collapse into it.
pub struct CircuitController {
    address: EndpointAddress,
    channel: Arc<dyn ControlChannel>,
    policy: RotationPolicy,
    dead_after: u32,
    settle_delay: Duration,
    status: RwLock<ControllerStatus>,
    requests_since_rotation: AtomicU64,
    rotation_count: AtomicU64,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    rotating: AtomicBool,
    rotation_lock: Mutex<()>,
}

impl CircuitController {
    pub fn new(
        address: EndpointAddress,
        channel: Arc<dyn ControlChannel>,
        policy: RotationPolicy,
        dead_after: u32,
        settle_delay: Duration,
    ) -> Self {
        Self {
            address,
            channel,
            policy,
            dead_after: dead_after.max(1),
            settle_delay,
            status: RwLock::new(ControllerStatus::default()),
            requests_since_rotation: AtomicU64::new(0),
            rotation_count: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            rotating: AtomicBool::new(false),
            rotation_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> usize {
        self.address.id
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn state(&self) -> EndpointState {
        self.status.read().state
    }

    pub fn requests_since_rotation(&self) -> u64 {
        self.requests_since_rotation.load(Ordering::Acquire)
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count.load(Ordering::Acquire)
    }

    /// Whether a rotation is running or scheduled
    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::Acquire)
    }

    /// Count one request on the current circuit, scheduling a rotation once
    /// the policy interval is reached. Never waits for the rotation.
    pub fn record_request(self: &Arc<Self>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.status.write().last_used_at = Some(Utc::now());

        let count = self.requests_since_rotation.fetch_add(1, Ordering::AcqRel) + 1;

        if self.policy.interval > 0 && count >= self.policy.interval {
            debug!(
                endpoint = self.address.id,
                requests = count,
                "Rotation interval reached"
            );
            self.trigger_rotation();
        }
    }

    /// Note a failed request; proxy-attributable failures rotate the circuit
    /// when the policy asks for it
    pub fn record_error(self: &Arc<Self>, kind: FailureKind) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.status.write().last_error = Some(format!("request failed: {}", kind));

        if self.policy.rotate_on_error && kind.is_proxy_attributable() {
            debug!(endpoint = self.address.id, kind = %kind, "Rotating after proxy error");
            self.trigger_rotation();
        }
    }

    /// A request went through this endpoint
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.promote();
    }

    /// Apply the result of a pre-flight reachability probe
    pub fn observe_probe(&self, reachable: bool) {
        if reachable {
            self.promote();
        } else {
            self.status.write().last_error = Some("health probe failed".to_string());
        }
    }

    fn promote(&self) {
        let mut status = self.status.write();
        if status.state == EndpointState::Starting {
            info!(endpoint = self.address.id, "Endpoint healthy");
            status.state = EndpointState::Healthy;
        }
    }

    /// Take the endpoint out of service for the rest of the process lifetime
    pub fn mark_dead(&self, reason: impl Into<String>) {
        let mut status = self.status.write();
        status.state = EndpointState::Dead;
        status.last_error = Some(reason.into());
    }

    /// Schedule a rotation in the background unless one is already pending
    ///
    /// Returns `true` if this call scheduled it.
    pub fn trigger_rotation(self: &Arc<Self>) -> bool {
        if self.state() == EndpointState::Dead {
            return false;
        }

        if self
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Leases can be released while the runtime shuts down
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.rotating.store(false, Ordering::Release);
            return false;
        };

        let controller = Arc::clone(self);
        runtime.spawn(async move {
            // Failures are recorded in the endpoint state
            let _ = controller.rotate().await;
            controller.rotating.store(false, Ordering::Release);
        });

        true
    }

    /// Request a new identity and wait for it
    ///
    /// On failure the endpoint is degraded, and killed once the consecutive
    /// failure threshold is reached. The request counter only resets on
    /// success, so the next request retries.
    #[instrument(skip(self), fields(endpoint = self.address.id))]
    pub async fn rotate(&self) -> Result<(), RotationError> {
        let _guard = self.rotation_lock.lock().await;

        if self.state() == EndpointState::Dead {
            return Err(RotationError::EndpointDead);
        }

        match self.channel.new_identity().await {
            Ok(()) => {
                self.requests_since_rotation.store(0, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                let rotations = self.rotation_count.fetch_add(1, Ordering::AcqRel) + 1;

                {
                    let mut status = self.status.write();
                    status.state = EndpointState::Healthy;
                    status.last_rotated_at = Some(Utc::now());
                    status.last_error = None;
                    status.exit_node = None;
                }

                match self.channel.exit_node().await {
                    Ok(exit_node) => self.status.write().exit_node = exit_node,
                    Err(e) => debug!(error = %e, "Could not read exit node"),
                }

                info!(rotations, "Circuit rotated");

                if !self.settle_delay.is_zero() {
                    tokio::time::sleep(self.settle_delay).await;
                }
                Ok(())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                let mut status = self.status.write();
                status.last_error = Some(e.to_string());

                if failures >= self.dead_after {
                    warn!(error = %e, failures, "Rotation failed, endpoint is dead");
                    status.state = EndpointState::Dead;
                } else {
                    warn!(error = %e, failures, "Rotation failed, endpoint degraded");
                    status.state = EndpointState::Degraded;
                }

                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> ProxyEndpoint {
        let status = self.status.read();
        ProxyEndpoint {
            id: self.address.id,
            socks_address: self.address.socks_address.clone(),
            control_address: self.address.control_address.clone(),
            state: status.state,
            requests_since_rotation: self.requests_since_rotation(),
            rotation_count: self.rotation_count(),
            last_rotated_at: status.last_rotated_at,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_used_at: status.last_used_at,
            last_error: status.last_error.clone(),
        }
    }

    pub fn identity(&self) -> IdentityInfo {
        let status = self.status.read();
        IdentityInfo {
            endpoint_id: self.address.id,
            rotation_count: self.rotation_count(),
            requests_since_rotation: self.requests_since_rotation(),
            last_rotated_at: status.last_rotated_at,
            exit_node: status.exit_node.clone(),
        }
    }
}

impl std::fmt::Debug for CircuitController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitController")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("requests_since_rotation", &self.requests_since_rotation())
            .finish()
    }
}
