use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure class of a task, as reported in results and batch statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connectivity,
    Timeout,
    RateLimited,
    ServerError,
    RemoteRejection,
    Protocol,
    Dns,
    PoolExhausted,
    Cancelled,
    InvalidTarget,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connectivity => "connectivity",
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::RemoteRejection => "remote_rejection",
            FailureKind::Protocol => "protocol",
            FailureKind::Dns => "dns",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::InvalidTarget => "invalid_target",
            FailureKind::Internal => "internal",
        }
    }

    /// Retryable failures are attempted again within the task's budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Connectivity
                | FailureKind::Timeout
                | FailureKind::RateLimited
                | FailureKind::ServerError
        )
    }

    /// Failures blamed on the circuit rather than the remote target
    pub fn is_proxy_attributable(&self) -> bool {
        matches!(self, FailureKind::Connectivity | FailureKind::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A link found on a search results page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
}

/// Parser output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ParsedBody {
    Raw(String),
    Text(String),
    Links(Vec<SearchHit>),
}

/// Successful response of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub final_url: String,
    pub status: u16,
    pub body: ParsedBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        payload: Payload,
        proxy_id: Option<usize>,
        attempts_made: u32,
    },
    Failed {
        kind: FailureKind,
        attempts_made: u32,
        error: String,
    },
}

/// Result of exactly one task of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub batch_id: Uuid,
    /// Position of the task in its batch
    pub task_index: usize,
    pub target: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Success { payload, .. } => Some(payload),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn attempts_made(&self) -> u32 {
        match &self.outcome {
            Outcome::Success { attempts_made, .. } | Outcome::Failed { attempts_made, .. } => {
                *attempts_made
            }
        }
    }

    pub fn proxy_id(&self) -> Option<usize> {
        match &self.outcome {
            Outcome::Success { proxy_id, .. } => *proxy_id,
            Outcome::Failed { .. } => None,
        }
    }
}

/// Counters for a completed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes dropped because their identity key was already seen
    pub duplicates: usize,
    pub failed_by_kind: BTreeMap<FailureKind, usize>,
}

impl BatchStats {
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.failed += 1;
        *self.failed_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failed_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Caller-facing outcome of a submitted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// Unique successes in submission order
    pub successes: Vec<FetchResult>,
    pub failures: Vec<FetchResult>,
    pub stats: BatchStats,
}
