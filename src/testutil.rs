//! Test utilities: mock implementations of the network seams.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchError, Result, RotationError};
use crate::models::{EndpointAddress, ExitNode, RotationPolicy};
use crate::proxy::circuit::CircuitController;
use crate::proxy::control::ControlChannel;
use crate::proxy::transport::{HttpBackend, RawResponse};

// ---------------------------------------------------------------------------
// MockControlChannel
// ---------------------------------------------------------------------------

/// Control channel that counts new-identity requests.
#[derive(Clone)]
pub struct MockControlChannel {
    /// Results of successive calls. When empty, `always` is used.
    results: Arc<Mutex<VecDeque<std::result::Result<(), RotationError>>>>,
    always: Option<RotationError>,
    calls: Arc<Mutex<usize>>,
    delay: Duration,
    exit_node: Option<ExitNode>,
}

impl MockControlChannel {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(VecDeque::new())),
            always: None,
            calls: Arc::new(Mutex::new(0)),
            delay: Duration::ZERO,
            exit_node: None,
        }
    }

    /// Every call fails with `error`.
    pub fn failing(error: RotationError) -> Self {
        Self {
            always: Some(error),
            ..Self::new()
        }
    }

    pub fn with_results(results: Vec<std::result::Result<(), RotationError>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_exit_node(mut self, exit_node: ExitNode) -> Self {
        self.exit_node = Some(exit_node);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ControlChannel for MockControlChannel {
    async fn new_identity(&self) -> std::result::Result<(), RotationError> {
        *self.calls.lock().unwrap() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.results.lock().unwrap().pop_front();
        match (next, &self.always) {
            (Some(result), _) => result,
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Ok(()),
        }
    }

    async fn exit_node(&self) -> std::result::Result<Option<ExitNode>, RotationError> {
        Ok(self.exit_node.clone())
    }
}

/// `count` controllers sharing `channel`, with no settle delay.
pub fn controllers_with(
    count: usize,
    channel: MockControlChannel,
    interval: u64,
    dead_after: u32,
) -> Vec<Arc<CircuitController>> {
    (0..count)
        .map(|id| {
            let port = 9050 + (id as u16) * 2;
            Arc::new(CircuitController::new(
                EndpointAddress::new(id, "127.0.0.1", port, port + 1),
                Arc::new(channel.clone()),
                RotationPolicy {
                    interval,
                    rotate_on_error: true,
                },
                dead_after,
                Duration::ZERO,
            ))
        })
        .collect()
}

/// Controllers whose rotation interval is never reached in a test.
pub fn test_controllers(count: usize) -> Vec<Arc<CircuitController>> {
    controllers_with(count, MockControlChannel::new(), 1000, 3)
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// HTTP backend replaying scripted responses.
///
/// Each call pops the next scripted result; when the script runs out the
/// `fallback` is returned. Calls are recorded as `(url, endpoint id)`.
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<Result<RawResponse>>>>,
    fallback: Arc<dyn Fn() -> Result<RawResponse> + Send + Sync>,
    /// Per-URL responses that take precedence over the script
    routes: Arc<Mutex<Vec<(String, Behavior)>>>,
    /// Number of leading calls that never complete
    hang_remaining: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<(String, Option<usize>)>>>,
}

#[derive(Clone)]
enum Behavior {
    Respond(RawResponse),
    Hang,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<RawResponse>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: Arc::new(|| Ok(html("<html><body>default</body></html>"))),
            routes: Arc::new(Mutex::new(Vec::new())),
            hang_remaining: Arc::new(Mutex::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every call fails with an error built by `make`.
    pub fn failing_with(make: fn() -> FetchError) -> Self {
        Self {
            fallback: Arc::new(move || Err(make())),
            ..Self::new(Vec::new())
        }
    }

    /// Requests for `url` never complete.
    pub fn hang_on(self, url: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url.to_string(), Behavior::Hang));
        self
    }

    /// The first `count` calls, to any URL, never complete.
    pub fn hang_first(self, count: usize) -> Self {
        *self.hang_remaining.lock().unwrap() = count;
        self
    }

    /// Requests for `url` get `response`.
    pub fn respond_to(self, url: &str, response: RawResponse) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url.to_string(), Behavior::Respond(response)));
        self
    }

    pub fn calls(&self) -> Vec<(String, Option<usize>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn get(
        &self,
        url: &str,
        route: Option<&EndpointAddress>,
        _timeout: Duration,
    ) -> Result<RawResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), route.map(|r| r.id)));

        let hang = {
            let mut remaining = self.hang_remaining.lock().unwrap();
            let hang = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            hang
        };
        if hang {
            return std::future::pending().await;
        }

        let behavior = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(route_url, _)| route_url == url)
            .map(|(_, behavior)| behavior.clone());

        match behavior {
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::Respond(response)) => Ok(response),
            None => {
                let next = self.script.lock().unwrap().pop_front();
                next.unwrap_or_else(|| (self.fallback)())
            }
        }
    }
}

/// A `text/html` response with status 200.
pub fn html(body: &str) -> RawResponse {
    RawResponse {
        final_url: String::new(),
        status: 200,
        content_type: Some("text/html; charset=utf-8".to_string()),
        retry_after: None,
        body: body.to_string(),
    }
}

/// An empty response with the given status.
pub fn status(code: u16) -> RawResponse {
    RawResponse {
        status: code,
        body: String::new(),
        ..html("")
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
