//! Anonymizing proxy layer
//!
//! This module provides:
//! - Tor control-port sessions for new identities
//! - Per-endpoint circuit rotation
//! - A pool of endpoints with pluggable selection strategies
//! - HTTP transport with retry and backoff
//! - Pre-flight health checks

pub mod circuit;
pub mod control;
pub mod health;
pub mod pool;
pub mod selection;
pub mod transport;

pub use circuit::CircuitController;
pub use control::{ControlAuth, ControlChannel, TorControlChannel};
pub use health::{HealthMonitor, HealthReport};
pub use pool::{AttemptOutcome, Lease, ProxyPool};
pub use selection::{create_selector, EndpointSelector, SelectionStrategy};
pub use transport::{
    CircuitStickiness, HttpBackend, RawResponse, ReqwestBackend, RetryConfig, RetryingTransport,
    TaskProgress,
};
