//! Bounded-concurrency batch executor

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::models::{Batch, FailureKind, FetchResult, FetchTask, Outcome};
use crate::proxy::pool::ProxyPool;
use crate::proxy::transport::{RetryingTransport, TaskProgress};

/// Cancels a running batch
///
/// Outstanding tasks resolve to `Cancelled` and drop their leases; results
/// that already completed are still returned.
pub struct CancelHandle {
    cancel_tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel_tx: tx }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// Maps the tasks of a batch onto at most `worker_limit` concurrent workers
pub struct FetchDispatcher {
    pool: Arc<ProxyPool>,
    transport: Arc<RetryingTransport>,
}

impl FetchDispatcher {
    pub fn new(pool: Arc<ProxyPool>, transport: Arc<RetryingTransport>) -> Self {
        Self { pool, transport }
    }

    /// Run every task of `batch`; results come back in completion order
    pub async fn run(&self, batch: &Batch, worker_limit: usize) -> Vec<FetchResult> {
        let (_handle, cancel) = CancelHandle::new();
        self.run_with_cancel(batch, worker_limit, cancel).await
    }

    /// Like [`run`](Self::run), stopping early once `cancel` turns true
    ///
    /// Every task still yields exactly one result.
    #[instrument(skip_all, fields(batch_id = %batch.id, tasks = batch.len(), worker_limit = worker_limit))]
    pub async fn run_with_cancel(
        &self,
        batch: &Batch,
        worker_limit: usize,
        cancel: watch::Receiver<bool>,
    ) -> Vec<FetchResult> {
        let limit = worker_limit.max(1);

        let results = stream::iter(batch.tasks.iter().enumerate())
            .map(|(index, task)| self.run_task(batch.id, index, task, cancel.clone()))
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            "Batch finished"
        );

        results
    }

    async fn run_task(
        &self,
        batch_id: Uuid,
        task_index: usize,
        task: &FetchTask,
        mut cancel: watch::Receiver<bool>,
    ) -> FetchResult {
        let outcome = self.resolve(task, &mut cancel).await;

        if let Outcome::Failed { kind, error, .. } = &outcome {
            debug!(task_index, target = %task.target, kind = %kind, error = %error, "Task failed");
        }

        FetchResult {
            batch_id,
            task_index,
            target: task.target.clone(),
            outcome,
        }
    }

    async fn resolve(&self, task: &FetchTask, cancel: &mut watch::Receiver<bool>) -> Outcome {
        if *cancel.borrow() {
            return cancelled(0);
        }

        let lease = if task.uses_anonymizing_proxy {
            match self.pool.acquire() {
                Ok(lease) => Some(lease),
                Err(e) => {
                    return Outcome::Failed {
                        kind: e.kind(),
                        attempts_made: 0,
                        error: e.to_string(),
                    }
                }
            }
        } else {
            None
        };

        let progress = TaskProgress::new();
        let work = timeout(task.timeout, self.transport.execute(task, lease, &progress));
        // Flag the task before the in-flight attempt is dropped
        let on_cancel = async {
            wait_cancelled(cancel).await;
            progress.mark_cancelled();
        };

        tokio::select! {
            result = work => match result {
                Ok(outcome) => outcome,
                Err(_) => Outcome::Failed {
                    kind: FailureKind::Timeout,
                    attempts_made: progress.attempts(),
                    error: format!("task timed out after {}s", task.timeout.as_secs_f64()),
                },
            },
            _ = on_cancel => cancelled(progress.attempts()),
        }
    }
}

fn cancelled(attempts_made: u32) -> Outcome {
    Outcome::Failed {
        kind: FailureKind::Cancelled,
        attempts_made,
        error: "batch cancelled".to_string(),
    }
}

/// Resolves once the batch is cancelled; never resolves if the handle is gone
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
