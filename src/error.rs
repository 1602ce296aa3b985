//! Error types for the gateway
//!
//! Every failure a caller can observe maps onto one [`GatewayError`] variant. Admission
//! denials and open circuits carry machine-readable reason codes and retry guidance so the
//! HTTP layer can answer immediately instead of waiting for upstream recovery.

use std::time::Duration;

use thiserror::Error;

use crate::resilience::CircuitState;

/// Result type alias using [`GatewayError`]
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Admission denied by the cost-aware limiter
    #[error("Rate limit exceeded ({reason}): {message}")]
    RateLimitExceeded {
        reason: String,
        message: String,
        retry_after: u64,
    },

    /// A circuit breaker is refusing calls to a protected operation
    #[error("Service unavailable: {operation} circuit is {state} after {failure_count} failures")]
    ServiceUnavailable {
        operation: String,
        failure_count: u32,
        state: CircuitState,
        retry_after: u64,
    },

    /// A metered data source did not answer within its timeout
    #[error("Upstream timeout: {source_name} did not respond within {timeout:?}")]
    UpstreamTimeout {
        source_name: String,
        timeout: Duration,
    },

    /// Malformed client identifier or request shape
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization failures while encoding responses
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything unexpected
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable error code used in JSON bodies
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::ServiceUnavailable { .. } => "service_unavailable",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Serialization(_) | GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Seconds the caller should wait before retrying, when that is known
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after, .. }
            | GatewayError::ServiceUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether a retry handler may try the same operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::UpstreamTimeout { .. })
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
