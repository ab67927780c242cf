use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::fetch::parser::{RawBodyParser, ResponseParser};

/// Default attempt budget for a task
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default hard timeout for a task
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One unit of fetch work: a target plus the parser for its response
///
/// Immutable once submitted; cloning shares the parser.
#[derive(Clone)]
pub struct FetchTask {
    pub target: String,
    pub uses_anonymizing_proxy: bool,
    pub max_attempts: u32,
    /// Hard deadline of the whole task, retries and backoff included
    pub timeout: Duration,
    /// Deadline of a single attempt
    pub attempt_timeout: Option<Duration>,
    pub parser: Arc<dyn ResponseParser>,
}

impl FetchTask {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            uses_anonymizing_proxy: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
            attempt_timeout: None,
            parser: Arc::new(RawBodyParser),
        }
    }

    /// Build a task from a URL template containing `{query}`
    pub fn from_template(template: &str, query: &str) -> Self {
        Self::new(expand_template(template, query))
    }

    pub fn anonymized(mut self, anonymized: bool) -> Self {
        self.uses_anonymizing_proxy = anonymized;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn parser(mut self, parser: Arc<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Deadline of one attempt: the explicit value, otherwise an even share
    /// of the task timeout so every attempt in the budget can run
    pub fn per_attempt_timeout(&self) -> Duration {
        self.attempt_timeout
            .unwrap_or_else(|| self.timeout / self.max_attempts.max(1))
    }
}

impl std::fmt::Debug for FetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTask")
            .field("target", &self.target)
            .field("uses_anonymizing_proxy", &self.uses_anonymizing_proxy)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("parser", &self.parser.name())
            .finish()
    }
}

/// Substitute a URL-encoded query into every `{query}` placeholder
pub fn expand_template(template: &str, query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    template.replace("{query}", &encoded)
}

/// Tasks submitted and tracked together
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub tasks: Vec<FetchTask>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(tasks: Vec<FetchTask>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_template_encodes_query() {
        let url = expand_template("http://engine.onion/search?q={query}", "ransomware leak & dump");
        assert_eq!(
            url,
            "http://engine.onion/search?q=ransomware+leak+%26+dump"
        );
    }

    #[test]
    fn test_task_builder() {
        let task = FetchTask::from_template("http://engine.onion/?q={query}", "test")
            .anonymized(false)
            .max_attempts(0)
            .timeout(Duration::from_secs(5));

        assert_eq!(task.target, "http://engine.onion/?q=test");
        assert!(!task.uses_anonymizing_proxy);
        // an attempt budget of zero would never touch the network
        assert_eq!(task.max_attempts, 1);
        assert_eq!(task.timeout, Duration::from_secs(5));
        assert_eq!(task.parser.name(), "raw");
    }

    #[test]
    fn test_per_attempt_timeout() {
        let task = FetchTask::new("http://a.onion/")
            .timeout(Duration::from_secs(30))
            .max_attempts(3);
        assert_eq!(task.per_attempt_timeout(), Duration::from_secs(10));

        let task = task.attempt_timeout(Some(Duration::from_secs(4)));
        assert_eq!(task.per_attempt_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let a = Batch::new(vec![FetchTask::new("http://a.onion/")]);
        let b = Batch::new(vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }
}
