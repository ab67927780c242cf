//! Pre-flight health checks
//!
//! Probes each endpoint's SOCKS port and, optionally, a set of target URLs.
//! Every probe is bounded by a timeout and the report is advisory: nothing
//! here fails or delays a batch beyond the probes themselves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, instrument, warn};

use super::circuit::CircuitController;
use super::pool::ProxyPool;
use super::transport::HttpBackend;
use crate::config::HealthConfig;
use crate::models::PoolHealth;

/// Target statuses that prove the target is up
const ALIVE_STATUSES: &[u16] = &[200, 403, 404];

/// Result of probing one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointProbe {
    pub endpoint_id: usize,
    pub socks_address: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of probing one target URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProbe {
    pub url: String,
    pub alive: bool,
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub endpoints: Vec<EndpointProbe>,
    pub targets: Vec<TargetProbe>,
    /// Pool state after the probes were applied
    pub pool: PoolHealth,
}

impl HealthReport {
    pub fn reachable_endpoints(&self) -> usize {
        self.endpoints.iter().filter(|p| p.reachable).count()
    }

    pub fn alive_targets(&self) -> HashSet<&str> {
        self.targets
            .iter()
            .filter(|t| t.alive)
            .map(|t| t.url.as_str())
            .collect()
    }
}

pub struct HealthMonitor {
    pool: Arc<ProxyPool>,
    backend: Arc<dyn HttpBackend>,
    config: HealthConfig,
    concurrency: usize,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ProxyPool>, backend: Arc<dyn HttpBackend>, config: HealthConfig) -> Self {
        Self {
            pool,
            backend,
            config,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Probe every endpoint, then every target
    ///
    /// Endpoint results are applied to the controllers: a reachable
    /// `Starting` endpoint becomes `Healthy`.
    #[instrument(skip(self, targets), fields(endpoints = self.pool.len(), targets = targets.len()))]
    pub async fn check_pool(&self, targets: &[String]) -> HealthReport {
        let endpoints = futures::stream::iter(self.pool.controllers().iter().cloned())
            .map(|controller| async move {
                let probe = self.probe_endpoint(&controller).await;
                controller.observe_probe(probe.reachable);
                probe
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut endpoints = endpoints;
        endpoints.sort_by_key(|p| p.endpoint_id);

        let targets = futures::stream::iter(targets.iter())
            .map(|url| self.probe_target(url))
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let report = HealthReport {
            checked_at: Utc::now(),
            endpoints,
            targets,
            pool: self.pool.health(),
        };

        info!(
            reachable = report.reachable_endpoints(),
            alive_targets = report.alive_targets().len(),
            "Health check complete"
        );

        report
    }

    /// Open a connection through the endpoint's SOCKS port
    #[instrument(skip(self, controller), fields(endpoint = controller.id()))]
    pub async fn probe_endpoint(&self, controller: &CircuitController) -> EndpointProbe {
        let socks_address = controller.address().socks_address.clone();
        let started = Instant::now();

        let result = timeout(
            self.config.timeout,
            connect_probe(&socks_address, self.config.probe_target.as_ref()),
        )
        .await;

        let (reachable, error) = match result {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(format!("connect failed: {}", e))),
            Err(_) => (false, Some("connect timed out".to_string())),
        };

        if let Some(error) = &error {
            warn!(socks = %socks_address, error = %error, "Endpoint unreachable");
        } else {
            debug!(socks = %socks_address, "Endpoint reachable");
        }

        EndpointProbe {
            endpoint_id: controller.id(),
            socks_address,
            reachable,
            latency_ms: reachable.then(|| started.elapsed().as_millis() as u64),
            error,
        }
    }

    /// GET a target through the pool; 200, 403 and 404 count as alive
    ///
    /// Probes do not count toward the rotation interval.
    #[instrument(skip(self))]
    pub async fn probe_target(&self, url: &str) -> TargetProbe {
        let lease = match self.pool.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                return TargetProbe {
                    url: url.to_string(),
                    alive: false,
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let result = self
            .backend
            .get(url, Some(lease.address()), self.config.timeout)
            .await;

        match result {
            Ok(response) => TargetProbe {
                url: url.to_string(),
                alive: ALIVE_STATUSES.contains(&response.status),
                status: Some(response.status),
                error: None,
            },
            Err(e) => TargetProbe {
                url: url.to_string(),
                alive: false,
                status: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Reach `target` through the SOCKS port, or only connect to the port when
/// there is no target
async fn connect_probe(
    socks_address: &str,
    target: Option<&(String, u16)>,
) -> std::result::Result<(), anyhow::Error> {
    let socket = TcpStream::connect(socks_address).await?;

    if let Some((host, port)) = target {
        Socks5Stream::connect_with_socket(socket, (host.as_str(), *port)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::models::{EndpointAddress, EndpointState, RotationPolicy};
    use crate::proxy::selection::RoundRobinSelector;
    use crate::testutil::{status, MockControlChannel, ScriptedBackend};

    /// Minimal SOCKS5 server without auth that accepts one CONNECT
    async fn fake_socks5() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();

            // Greeting: VER, NMETHODS, METHODS...
            let mut header = [0u8; 2];
            client.read_exact(&mut header).await.unwrap();
            let mut methods = vec![0u8; header[1] as usize];
            client.read_exact(&mut methods).await.unwrap();
            client.write_all(&[0x05, 0x00]).await.unwrap();

            // CONNECT request: VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT
            let mut req_head = [0u8; 4];
            client.read_exact(&mut req_head).await.unwrap();
            assert_eq!(req_head[1], 0x01);
            let addr_len = match req_head[3] {
                0x01 => 4,
                0x04 => 16,
                _ => {
                    let mut len = [0u8; 1];
                    client.read_exact(&mut len).await.unwrap();
                    len[0] as usize
                }
            };
            let mut rest = vec![0u8; addr_len + 2];
            client.read_exact(&mut rest).await.unwrap();

            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        addr
    }

    fn controller(id: usize, socks_port: u16) -> Arc<CircuitController> {
        Arc::new(CircuitController::new(
            EndpointAddress::new(id, "127.0.0.1", socks_port, 1),
            Arc::new(MockControlChannel::new()),
            RotationPolicy::default(),
            3,
            Duration::ZERO,
        ))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_check_pool_probes_socks_ports() {
        let socks = fake_socks5().await;
        let dead_port = unused_port().await;
        let controllers = vec![controller(0, socks.port()), controller(1, dead_port)];
        let pool = Arc::new(
            ProxyPool::new(controllers.clone(), Arc::new(RoundRobinSelector::new())).unwrap(),
        );

        let monitor = HealthMonitor::new(
            pool,
            Arc::new(ScriptedBackend::new(vec![])),
            HealthConfig {
                probe_target: Some(("check.torproject.org".to_string(), 80)),
                timeout: Duration::from_secs(2),
            },
        );
        let report = monitor.check_pool(&[]).await;

        assert_eq!(report.endpoints.len(), 2);
        assert!(report.endpoints[0].reachable);
        assert!(report.endpoints[0].latency_ms.is_some());
        assert!(!report.endpoints[1].reachable);
        assert!(report.endpoints[1].error.is_some());

        assert_eq!(controllers[0].state(), EndpointState::Healthy);
        assert_eq!(controllers[1].state(), EndpointState::Starting);
        assert_eq!(report.pool.healthy, 1);
    }

    #[tokio::test]
    async fn test_target_probe_liveness() {
        let backend = ScriptedBackend::new(vec![])
            .respond_to("http://up.onion/", status(200))
            .respond_to("http://forbidden.onion/", status(403))
            .respond_to("http://gone.onion/", status(404))
            .respond_to("http://broken.onion/", status(502));
        let pool = Arc::new(
            ProxyPool::new(vec![controller(0, 9050)], Arc::new(RoundRobinSelector::new()))
                .unwrap(),
        );
        let monitor = HealthMonitor::new(pool, Arc::new(backend), HealthConfig::default());

        let targets: Vec<String> = [
            "http://up.onion/",
            "http://forbidden.onion/",
            "http://gone.onion/",
            "http://broken.onion/",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mut alive = Vec::new();
        for target in &targets {
            alive.push(monitor.probe_target(target).await.alive);
        }
        assert_eq!(alive, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_target_probe_with_exhausted_pool() {
        let endpoint = controller(0, 9050);
        endpoint.mark_dead("test");
        let pool = Arc::new(
            ProxyPool::new(vec![endpoint], Arc::new(RoundRobinSelector::new())).unwrap(),
        );
        let backend = ScriptedBackend::new(vec![]);
        let monitor =
            HealthMonitor::new(pool, Arc::new(backend.clone()), HealthConfig::default());

        let probe = monitor.probe_target("http://up.onion/").await;
        assert!(!probe.alive);
        assert!(probe.error.is_some());
        assert!(backend.calls().is_empty());
    }
}
