use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a proxy endpoint
///
/// `Starting → Healthy` on the first successful probe or request,
/// `Healthy ⇄ Degraded` on rotation failure/success, `Degraded → Dead` after
/// too many consecutive rotation failures. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    #[default]
    Starting,
    Healthy,
    Degraded,
    Dead,
}

impl EndpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Starting => "starting",
            EndpointState::Healthy => "healthy",
            EndpointState::Degraded => "degraded",
            EndpointState::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" => Some(EndpointState::Starting),
            "healthy" => Some(EndpointState::Healthy),
            "degraded" => Some(EndpointState::Degraded),
            "dead" => Some(EndpointState::Dead),
            _ => None,
        }
    }

    /// Any state except `Dead` may be handed out by the pool
    pub fn is_usable(&self) -> bool {
        !matches!(self, EndpointState::Dead)
    }

    /// States the pool selects from before falling back to degraded endpoints
    pub fn is_preferred(&self) -> bool {
        matches!(self, EndpointState::Starting | EndpointState::Healthy)
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Addressing of one local proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub id: usize,
    /// SOCKS5 data port, `host:port`
    pub socks_address: String,
    /// Control port, `host:port`
    pub control_address: String,
}

impl EndpointAddress {
    pub fn new(id: usize, host: &str, socks_port: u16, control_port: u16) -> Self {
        Self {
            id,
            socks_address: format!("{}:{}", host, socks_port),
            control_address: format!("{}:{}", host, control_port),
        }
    }

    /// Proxy URL with remote DNS resolution
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks_address)
    }
}

/// Exit relay of the circuit currently in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNode {
    pub fingerprint: String,
    pub nickname: Option<String>,
}

/// Point-in-time view of a proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: usize,
    pub socks_address: String,
    pub control_address: String,
    pub state: EndpointState,
    pub requests_since_rotation: u64,
    pub rotation_count: u64,
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// Attempts routed through this endpoint since startup
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProxyEndpoint {
    /// Share of finished attempts that succeeded
    pub fn success_rate(&self) -> Option<f64> {
        success_rate(self.successes, self.failures)
    }
}

fn success_rate(successes: u64, failures: u64) -> Option<f64> {
    let finished = successes + failures;
    (finished > 0).then(|| successes as f64 / finished as f64)
}

/// Current identity of an endpoint's circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub endpoint_id: usize,
    pub rotation_count: u64,
    pub requests_since_rotation: u64,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub exit_node: Option<ExitNode>,
}

/// When to request a fresh circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Requests per circuit before a rotation is triggered
    pub interval: u64,
    /// Rotate when a request fails for a proxy-attributable reason
    pub rotate_on_error: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: 5,
            rotate_on_error: true,
        }
    }
}

/// Aggregate health of the proxy pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub total: usize,
    pub starting: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub dead: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub endpoints: Vec<ProxyEndpoint>,
}

impl PoolHealth {
    pub fn from_endpoints(endpoints: Vec<ProxyEndpoint>) -> Self {
        let count = |state: EndpointState| endpoints.iter().filter(|e| e.state == state).count();

        Self {
            total: endpoints.len(),
            starting: count(EndpointState::Starting),
            healthy: count(EndpointState::Healthy),
            degraded: count(EndpointState::Degraded),
            dead: count(EndpointState::Dead),
            total_requests: endpoints.iter().map(|e| e.total_requests).sum(),
            total_successes: endpoints.iter().map(|e| e.successes).sum(),
            total_failures: endpoints.iter().map(|e| e.failures).sum(),
            endpoints,
        }
    }

    pub fn usable_count(&self) -> usize {
        self.total - self.dead
    }

    pub fn is_exhausted(&self) -> bool {
        self.usable_count() == 0
    }

    pub fn success_rate(&self) -> Option<f64> {
        success_rate(self.total_successes, self.total_failures)
    }
}
