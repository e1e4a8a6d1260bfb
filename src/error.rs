//! Error types shared across the fetch, parse and orchestration layers.

use std::time::Duration;

use thiserror::Error;

/// Classified outcome of a single upstream request that did not produce a body.
///
/// Every expected failure mode is a variant, so the retry policy can branch on
/// it instead of inspecting transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),
    #[error("API key rejected by upstream (HTTP {0})")]
    AuthRejected(u16),
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Returns `true` if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::NetworkUnreachable(_) => true,
            FetchError::RateLimited { .. } => true,
            FetchError::HttpStatus(code) => *code >= 500 || *code == 408,
            FetchError::AuthRejected(_) | FetchError::InvalidRequest(_) => false,
        }
    }
}

/// Failure to turn a response body into predictions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Well-formed payload with nothing due. Not a failure for the poll cycle.
    #[error("no predictions in payload")]
    Empty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no API key configured (set api_key or MUNI_API_KEY)")]
    MissingApiKey,
    #[error("invalid stop code '{0}'")]
    InvalidStopCode(String),
    #[error("stop code '{0}' is configured more than once")]
    DuplicateStop(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "worst-case poll time {worst_case:?} is not below the poll interval {interval:?}; \
         lower the timeout, attempts or max delay"
    )]
    PollBudgetExceeded {
        worst_case: Duration,
        interval: Duration,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced to the host when starting or reconfiguring the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("stop '{0}' is not configured")]
    UnknownStop(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::NetworkUnreachable("reset".into()).is_retryable());
        assert!(FetchError::RateLimited { retry_after: None }.is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(FetchError::HttpStatus(408).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::AuthRejected(401).is_retryable());
        assert!(!FetchError::InvalidRequest("bad url".into()).is_retryable());
    }
}
