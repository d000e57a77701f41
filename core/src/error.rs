//! Structured error types for the engine
//!
//! One taxonomy covers configuration, snapshot ingestion, provider I/O,
//! order validation, and state-machine misuse. The RPC surface converts
//! every variant into a `{status, error}` pair; nothing here ever crosses
//! the bridge as a panic.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    // =========================================================================
    // Configuration (fatal at init)
    // =========================================================================
    /// Invalid or incomplete configuration
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Required configuration key absent
    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    /// API key unavailable for an enabled provider
    #[error("API key not set for provider {provider}")]
    MissingApiKey { provider: String },

    // =========================================================================
    // Snapshot ingestion (per tick, recoverable)
    // =========================================================================
    /// Snapshot payload did not match the expected shape
    #[error("bad snapshot: {reason}")]
    BadSnapshot { reason: String },

    // =========================================================================
    // Provider I/O
    // =========================================================================
    /// Rate limited by the provider (429) or the local limiter
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider call exceeded its timeout
    #[error("provider call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Authentication rejected (401/403)
    #[error("authentication failed: {message}")]
    AuthFailure { message: String },

    /// Provider unreachable or returned a server error
    #[error("provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// Provider returned a body the engine could not interpret
    #[error("malformed provider response: {message}")]
    MalformedResponse { message: String },

    /// Circuit breaker is open; no outbound call was attempted
    #[error("circuit breaker open")]
    BreakerOpen,

    /// In-flight call cancelled by emergency stop
    #[error("provider call cancelled")]
    Cancelled,

    // =========================================================================
    // Order handling
    // =========================================================================
    /// Whole-reply parse failure (orders discarded)
    #[error("reply parse failed: {message}")]
    ParseFailure { message: String },

    /// Single order rejected by the sandbox
    #[error("order rejected: {reason}")]
    SandboxRejection { reason: String },

    // =========================================================================
    // State machine misuse (admin errors)
    // =========================================================================
    /// Operation invalid in the current AO lifecycle state
    #[error("state violation: {message}")]
    StateViolation { message: String },

    // =========================================================================
    // External wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),
}

impl EngineError {
    /// Transient errors get one retry with backoff before counting against
    /// the breaker.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout { .. } => true,
            Self::ProviderUnavailable { .. } => true,

            Self::Config { .. }
            | Self::MissingConfig { .. }
            | Self::MissingApiKey { .. }
            | Self::BadSnapshot { .. }
            | Self::AuthFailure { .. }
            | Self::MalformedResponse { .. }
            | Self::BreakerOpen
            | Self::Cancelled
            | Self::ParseFailure { .. }
            | Self::SandboxRejection { .. }
            | Self::StateViolation { .. }
            | Self::Io(_)
            | Self::Json(_) => false,
        }
    }

    /// Suggested delay before retrying a transient failure.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => {
                Some(retry_after.unwrap_or(Duration::from_secs(5)))
            }
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ProviderUnavailable { .. } => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Whether this failure should count toward opening the circuit breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::AuthFailure { .. }
                | Self::ProviderUnavailable { .. }
                | Self::MalformedResponse { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(EngineError::Timeout {
            timeout: Duration::from_secs(30)
        }
        .is_retryable());

        assert!(EngineError::RateLimited { retry_after: None }.is_retryable());

        assert!(!EngineError::AuthFailure {
            message: "bad key".to_string()
        }
        .is_retryable());

        assert!(!EngineError::BreakerOpen.is_retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(EngineError::Timeout {
            timeout: Duration::from_secs(30)
        }
        .counts_toward_breaker());
        assert!(EngineError::AuthFailure {
            message: "expired".into()
        }
        .counts_toward_breaker());
        assert!(!EngineError::ParseFailure {
            message: "not json".into()
        }
        .counts_toward_breaker());
        assert!(!EngineError::BreakerOpen.counts_toward_breaker());
    }

    #[test]
    fn test_retry_delay() {
        let err = EngineError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(7)));
        assert_eq!(
            EngineError::RateLimited { retry_after: None }.retry_delay(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(EngineError::BreakerOpen.retry_delay(), None);
    }
}
