//! Error types

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Coarse error classification surfaced in connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Timeout, DNS, refused connection. Retryable.
    Network,
    /// Non-success status or malformed payload. Retryable with backoff.
    Upstream,
    /// Out-of-band rate or non-positive price. Dropped, never retried.
    Validation,
    /// Bad static configuration. Fatal at startup only.
    Config,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Upstream)
    }
}

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Price feed errors
#[derive(Debug, Error)]
pub enum PriceFeedError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PriceFeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PriceFeedError::Network(_) | PriceFeedError::Timeout(_) => ErrorKind::Network,
            PriceFeedError::UpstreamStatus { .. } | PriceFeedError::InvalidMessage(_) => {
                ErrorKind::Upstream
            }
            PriceFeedError::Validation(_) => ErrorKind::Validation,
            PriceFeedError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for PriceFeedError {
    fn from(e: serde_json::Error) -> Self {
        PriceFeedError::InvalidMessage(e.to_string())
    }
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type PriceFeedResult<T> = Result<T, PriceFeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(PriceFeedError::Network("refused".into()).kind(), ErrorKind::Network);
        assert_eq!(PriceFeedError::Timeout(Duration::from_secs(5)).kind(), ErrorKind::Network);
        assert_eq!(
            PriceFeedError::UpstreamStatus { status: 503, body: String::new() }.kind(),
            ErrorKind::Upstream
        );
        assert_eq!(PriceFeedError::InvalidMessage("eof".into()).kind(), ErrorKind::Upstream);
        assert_eq!(PriceFeedError::Validation("rate".into()).kind(), ErrorKind::Validation);
        assert_eq!(PriceFeedError::Config("empty".into()).kind(), ErrorKind::Config);
    }

    #[test]
    fn test_retryability() {
        assert!(PriceFeedError::Network("dns".into()).is_retryable());
        assert!(PriceFeedError::InvalidMessage("bad".into()).is_retryable());
        assert!(!PriceFeedError::Validation("price".into()).is_retryable());
        assert!(!PriceFeedError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_json_error_maps_to_upstream() {
        let err: PriceFeedError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Upstream);
    }
}
