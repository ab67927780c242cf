//! robin-fetch - Anonymized Concurrent Fetch Engine
//!
//! Issues batches of HTTP requests through a rotating pool of local Tor
//! instances.
//!
//! ## Features
//!
//! - Circuit rotation per request interval and on proxy-attributable errors
//! - Pluggable endpoint selection (round-robin, random, least-connections)
//! - Retry with exponential backoff and `Retry-After` support
//! - Bounded-concurrency batch dispatch with per-task timeouts and cancellation
//! - Deduplicated, ordered batch results with failure statistics
//! - Advisory pre-flight health checks of proxies and targets

pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod proxy;
pub mod search;

#[cfg(test)]
pub mod testutil;

pub use config::Config;
pub use error::{FetchError, Result, RotationError};
pub use fetch::FetchEngine;
