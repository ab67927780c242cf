//! HTTP transport with retry and failure classification
//!
//! [`HttpBackend`] performs one GET, optionally routed through an endpoint's
//! SOCKS port. [`RetryingTransport`] drives the attempts of one task and
//! reports each of them back to the pool.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use tracing::{debug, instrument, warn};

use super::circuit::CircuitController;
use super::pool::{AttemptOutcome, Lease, ProxyPool};
use crate::error::{FetchError, Result};
use crate::models::{EndpointAddress, EndpointState, FailureKind, FetchTask, Outcome, Payload};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (X11; Linux i686; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36 Edg/135.0.3179.54",
];

/// Pick a browser `User-Agent` at random
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// A response as received, before status classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// One HTTP GET, routed through `route` when given
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn get(
        &self,
        url: &str,
        route: Option<&EndpointAddress>,
        timeout: Duration,
    ) -> Result<RawResponse>;
}

/// [`HttpBackend`] on `reqwest`, keeping one client per route
///
/// Routed clients resolve names through the proxy (`socks5h`).
pub struct ReqwestBackend {
    clients: DashMap<Option<usize>, reqwest::Client>,
    connect_timeout: Duration,
}

impl ReqwestBackend {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
        }
    }

    fn client_for(&self, route: Option<&EndpointAddress>) -> Result<reqwest::Client> {
        let key = route.map(|r| r.id);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(5));

        builder = match route {
            Some(route) => builder.proxy(
                reqwest::Proxy::all(route.proxy_url())
                    .map_err(|e| FetchError::Client(format!("invalid proxy url: {}", e)))?,
            ),
            None => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|e| FetchError::Client(format!("failed to build client: {}", e)))?;

        debug!(endpoint = ?key, "Created HTTP client");
        Ok(self.clients.entry(key).or_insert(client).clone())
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn get(
        &self,
        url: &str,
        route: Option<&EndpointAddress>,
        timeout: Duration,
    ) -> Result<RawResponse> {
        let parsed = url::Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidTarget(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let proxied = route.is_some();
        let client = self.client_for(route)?;

        let response = client
            .get(parsed)
            .header(USER_AGENT, random_user_agent())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, proxied))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e, proxied))?;

        Ok(RawResponse {
            final_url,
            status,
            content_type,
            retry_after,
            body,
        })
    }
}

/// Map a `reqwest` failure to the fetch error taxonomy
fn classify_reqwest_error(err: &reqwest::Error, proxied: bool) -> FetchError {
    let message = error_chain(err);

    if err.is_timeout() {
        return FetchError::Timeout;
    }
    if err.is_builder() {
        return FetchError::InvalidTarget(message);
    }
    if err.is_connect() {
        if proxied {
            return FetchError::Proxy(message);
        }
        let lower = message.to_lowercase();
        if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
            return FetchError::Dns(message);
        }
        return FetchError::Connectivity(message);
    }
    if err.is_body() || err.is_decode() || err.is_redirect() {
        return FetchError::Protocol(message);
    }

    FetchError::Connectivity(message)
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Classify a response by status code
pub fn check_status(response: &RawResponse) -> Result<()> {
    match response.status {
        200..=299 => Ok(()),
        429 => Err(FetchError::RateLimited {
            retry_after: response.retry_after,
        }),
        400..=499 => Err(FetchError::RemoteRejection {
            status: response.status,
        }),
        500..=599 => Err(FetchError::ServerError {
            status: response.status,
        }),
        status => Err(FetchError::Protocol(format!(
            "unexpected HTTP status {}",
            status
        ))),
    }
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let cap = self.cap.as_millis() as u64;
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        Duration::from_millis(exponential.min(cap))
    }

    /// Backoff, stretched to a server's `Retry-After` hint
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(attempt);
        retry_after.map_or(backoff, |hint| hint.max(backoff))
    }
}

/// Endpoint choice for the retries of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitStickiness {
    /// Keep the first leased endpoint for every attempt
    #[default]
    Sticky,
    /// Lease a fresh endpoint before every retry
    Reacquire,
}

impl CircuitStickiness {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sticky" => Some(Self::Sticky),
            "reacquire" => Some(Self::Reacquire),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::Reacquire => "reacquire",
        }
    }
}

/// Progress of one task, readable after its future is dropped
#[derive(Debug, Default)]
pub struct TaskProgress {
    attempts: AtomicU32,
    cancelled: AtomicBool,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// The task is being abandoned because its batch was cancelled
    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn interrupted_outcome(&self) -> AttemptOutcome {
        if self.cancelled.load(Ordering::Acquire) {
            AttemptOutcome::Abandoned
        } else {
            AttemptOutcome::Failure(FailureKind::Timeout)
        }
    }
}

/// An attempt through a leased endpoint that has not been reported yet
///
/// Dropping it unfinished, when the task deadline cuts the attempt off,
/// reports a timeout to the pool.
struct InFlightAttempt<'a> {
    pool: &'a ProxyPool,
    progress: &'a TaskProgress,
    controller: Option<Arc<CircuitController>>,
}

impl<'a> InFlightAttempt<'a> {
    fn start(pool: &'a ProxyPool, progress: &'a TaskProgress, lease: Option<&Lease>) -> Self {
        Self {
            pool,
            progress,
            controller: lease.map(|l| Arc::clone(l.controller())),
        }
    }

    fn finish(mut self, outcome: AttemptOutcome) {
        if let Some(controller) = self.controller.take() {
            self.pool.release(&controller, outcome);
        }
    }
}

impl Drop for InFlightAttempt<'_> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            let outcome = self.progress.interrupted_outcome();
            debug!(endpoint = controller.id(), ?outcome, "Attempt interrupted");
            self.pool.release(&controller, outcome);
        }
    }
}

/// Runs the attempts of one task
pub struct RetryingTransport {
    backend: Arc<dyn HttpBackend>,
    pool: Arc<ProxyPool>,
    retry: RetryConfig,
    stickiness: CircuitStickiness,
}

impl RetryingTransport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        pool: Arc<ProxyPool>,
        retry: RetryConfig,
        stickiness: CircuitStickiness,
    ) -> Self {
        Self {
            backend,
            pool,
            retry,
            stickiness,
        }
    }

    /// Execute `task`, retrying retryable failures within its attempt budget
    ///
    /// `lease` is the endpoint for anonymized tasks. Each attempt runs under
    /// the task's per-attempt deadline and is reported to the pool however it
    /// ends, including when this future is dropped mid-attempt.
    #[instrument(skip_all, fields(target = %task.target))]
    pub async fn execute(
        &self,
        task: &FetchTask,
        lease: Option<Lease>,
        progress: &TaskProgress,
    ) -> Outcome {
        let mut lease = lease;
        let max_attempts = task.max_attempts.max(1);
        let attempt_timeout = task.per_attempt_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            progress.attempts.store(attempt, Ordering::Release);

            let in_flight = InFlightAttempt::start(&self.pool, progress, lease.as_ref());
            let route = lease.as_ref().map(|l| l.address().clone());
            let result = tokio::time::timeout(
                attempt_timeout,
                self.attempt(task, route.as_ref(), attempt_timeout),
            )
            .await
            .unwrap_or(Err(FetchError::Timeout));

            in_flight.finish(match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(e) => AttemptOutcome::Failure(e.kind()),
            });

            let err = match result {
                Ok(payload) => {
                    return Outcome::Success {
                        payload,
                        proxy_id: lease.as_ref().map(|l| l.id()),
                        attempts_made: attempt,
                    }
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if !kind.is_retryable() || attempt >= max_attempts {
                debug!(attempt, kind = %kind, error = %err, "Giving up");
                return Outcome::Failed {
                    kind,
                    attempts_made: attempt,
                    error: err.to_string(),
                };
            }

            let delay = self.retry.delay_for(attempt, err.retry_after());
            warn!(
                attempt,
                max_attempts,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;

            let must_switch = lease
                .as_ref()
                .is_some_and(|l| l.state() == EndpointState::Dead);
            if lease.is_some() && (self.stickiness == CircuitStickiness::Reacquire || must_switch)
            {
                drop(lease.take());
                match self.pool.acquire() {
                    Ok(next) => lease = Some(next),
                    Err(e) => {
                        return Outcome::Failed {
                            kind: e.kind(),
                            attempts_made: attempt,
                            error: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        task: &FetchTask,
        route: Option<&EndpointAddress>,
        timeout: Duration,
    ) -> Result<Payload> {
        let response = self.backend.get(&task.target, route, timeout).await?;
        check_status(&response)?;

        let body = task
            .parser
            .parse_response(response.content_type.as_deref(), &response.body)?;

        Ok(Payload {
            final_url: response.final_url,
            status: response.status,
            body,
        })
    }
}
