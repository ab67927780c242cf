//! Batch submission API

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::aggregator::ResultAggregator;
use super::dispatcher::{CancelHandle, FetchDispatcher};
use crate::config::{Config, HealthConfig};
use crate::error::Result;
use crate::models::{Batch, BatchResult, FetchTask};
use crate::proxy::health::HealthMonitor;
use crate::proxy::pool::ProxyPool;
use crate::proxy::transport::{
    CircuitStickiness, HttpBackend, ReqwestBackend, RetryConfig, RetryingTransport,
};

/// Entry point for callers: owns the pool, the transport and the dispatcher
pub struct FetchEngine {
    pool: Arc<ProxyPool>,
    backend: Arc<dyn HttpBackend>,
    dispatcher: FetchDispatcher,
}

impl FetchEngine {
    pub fn new(
        pool: Arc<ProxyPool>,
        backend: Arc<dyn HttpBackend>,
        retry: RetryConfig,
        stickiness: CircuitStickiness,
    ) -> Self {
        let transport = Arc::new(RetryingTransport::new(
            Arc::clone(&backend),
            Arc::clone(&pool),
            retry,
            stickiness,
        ));
        let dispatcher = FetchDispatcher::new(Arc::clone(&pool), transport);

        Self {
            pool,
            backend,
            dispatcher,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = Arc::new(ProxyPool::from_config(config)?);
        let backend = Arc::new(ReqwestBackend::new(config.fetch.connect_timeout));

        Ok(Self::new(
            pool,
            backend,
            config.fetch.retry,
            config.pool.stickiness,
        ))
    }

    /// Run `tasks` with at most `worker_limit` in flight
    pub async fn submit_batch(&self, tasks: Vec<FetchTask>, worker_limit: usize) -> BatchResult {
        let (_handle, cancel) = CancelHandle::new();
        self.submit_batch_with_cancel(tasks, worker_limit, cancel)
            .await
    }

    /// Like [`submit_batch`](Self::submit_batch); once `cancel` turns true the
    /// outstanding tasks fail as `Cancelled`
    pub async fn submit_batch_with_cancel(
        &self,
        tasks: Vec<FetchTask>,
        worker_limit: usize,
        cancel: watch::Receiver<bool>,
    ) -> BatchResult {
        let batch = Batch::new(tasks);
        let results = self
            .dispatcher
            .run_with_cancel(&batch, worker_limit, cancel)
            .await;

        let mut failures: Vec<_> = results.iter().filter(|r| !r.is_success()).cloned().collect();
        failures.sort_by_key(|r| r.task_index);

        let (successes, stats) = ResultAggregator::merge(results, ResultAggregator::url_key);

        info!(
            batch_id = %batch.id,
            attempted = stats.attempted,
            unique = successes.len(),
            failed = stats.failed,
            "Batch merged"
        );

        BatchResult {
            batch_id: batch.id,
            successes,
            failures,
            stats,
        }
    }

    /// Health monitor sharing this engine's pool and backend
    pub fn health_monitor(&self, config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(Arc::clone(&self.pool), Arc::clone(&self.backend), config)
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }
}
