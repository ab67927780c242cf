use std::time::Duration;

use thiserror::Error;

use crate::models::FailureKind;

/// Unified error type for the fetch engine
#[derive(Error, Debug)]
pub enum FetchError {
    // Network errors
    #[error("Connection failed: {0}")]
    Connectivity(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Operation timed out")]
    Timeout,

    // Response errors
    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),

    #[error("Remote rejected request with HTTP {status}")]
    RemoteRejection { status: u16 },

    #[error("Rate limited by remote (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Remote server error HTTP {status}")]
    ServerError { status: u16 },

    // Pool errors
    #[error("No usable proxy endpoint: all endpoints are dead")]
    PoolExhausted,

    // Task errors
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Errors raised by a circuit controller while talking to the control port
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    #[error("Control port authentication failed: {0}")]
    AuthFailed(String),

    #[error("Control port unreachable: {0}")]
    Unreachable(String),

    #[error("Control port rejected command: {0}")]
    Rejected(String),

    #[error("Endpoint is dead")]
    EndpointDead,
}

/// Result type alias for fetch engine operations
pub type Result<T> = std::result::Result<T, FetchError>;

impl FetchError {
    /// Get the failure class reported in fetch results
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Connectivity(_) | FetchError::Proxy(_) => {
                FailureKind::Connectivity
            }

            FetchError::Dns(_) => FailureKind::Dns,

            FetchError::Timeout => FailureKind::Timeout,

            FetchError::Protocol(_) | FetchError::UnexpectedContentType(_) => {
                FailureKind::Protocol
            }

            FetchError::RemoteRejection { .. } => FailureKind::RemoteRejection,

            FetchError::RateLimited { .. } => FailureKind::RateLimited,

            FetchError::ServerError { .. } => FailureKind::ServerError,

            FetchError::PoolExhausted => FailureKind::PoolExhausted,

            FetchError::InvalidTarget(_) => FailureKind::InvalidTarget,

            FetchError::InvalidConfig(_) | FetchError::Client(_) => {
                FailureKind::Internal
            }
        }
    }

    /// Check if the transport should try this operation again
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Check if the failure is blamed on the circuit rather than the target
    pub fn is_proxy_attributable(&self) -> bool {
        self.kind().is_proxy_attributable()
    }

    /// Retry-After hint carried by a rate-limit response
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidTarget(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            FetchError::Connectivity("reset".to_string()).kind(),
            FailureKind::Connectivity
        );
        assert_eq!(
            FetchError::Proxy("general SOCKS server failure".to_string()).kind(),
            FailureKind::Connectivity
        );
        assert_eq!(FetchError::Timeout.kind(), FailureKind::Timeout);
        assert_eq!(
            FetchError::RemoteRejection { status: 404 }.kind(),
            FailureKind::RemoteRejection
        );
        assert_eq!(
            FetchError::RateLimited { retry_after: None }.kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            FetchError::ServerError { status: 503 }.kind(),
            FailureKind::ServerError
        );
        assert_eq!(
            FetchError::UnexpectedContentType("image/png".to_string()).kind(),
            FailureKind::Protocol
        );
        assert_eq!(FetchError::PoolExhausted.kind(), FailureKind::PoolExhausted);
        assert_eq!(
            FetchError::InvalidConfig("no endpoints".to_string()).kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn test_error_retry_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Connectivity("reset".to_string()).is_retryable());
        assert!(FetchError::ServerError { status: 502 }.is_retryable());
        assert!(FetchError::RateLimited { retry_after: None }.is_retryable());

        assert!(!FetchError::RemoteRejection { status: 403 }.is_retryable());
        assert!(!FetchError::Protocol("truncated".to_string()).is_retryable());
        assert!(!FetchError::Dns("no such host".to_string()).is_retryable());
        assert!(!FetchError::PoolExhausted.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(FetchError::Timeout.retry_after(), None);
    }

    #[test]
    fn test_url_parse_error_is_invalid_target() {
        let err: FetchError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, FetchError::InvalidTarget(_)));
    }
}
