//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the resilience pipeline itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting calls to the resource
    #[error("Circuit breaker for '{resource}' is open, rejecting calls")]
    CircuitOpen { resource: String },

    /// The wrapped operation exceeded its per-attempt timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation
    #[error("Operation was cancelled")]
    Cancelled,

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// No pipeline was registered under the requested name
    #[error("No resilience pipeline registered for '{0}'")]
    UnknownPipeline(String),
}

/// Classification hook the pipeline uses for any error type it wraps.
pub trait Recoverable {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Whether this outcome counts as a failure in the breaker's sampling window.
    fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }
}

impl Recoverable for ResilienceError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout(_)
        )
    }

    fn trips_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::Cancelled
                | ResilienceError::UnknownPipeline(_)
        )
    }
}

impl ResilienceError {
    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_)
                | ResilienceError::CircuitOpen { .. }
                | ResilienceError::UnknownPipeline(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Transient("network error".to_string());
        assert!(transient.is_retryable());
        assert!(!transient.is_permanent());
        assert!(transient.trips_breaker());

        let permanent = ResilienceError::Permanent("auth failed".to_string());
        assert!(!permanent.is_retryable());
        assert!(permanent.is_permanent());
        assert!(permanent.trips_breaker());

        let circuit_open = ResilienceError::CircuitOpen {
            resource: "broker".to_string(),
        };
        assert!(!circuit_open.is_retryable());
        assert!(circuit_open.is_permanent());
        assert!(!circuit_open.trips_breaker());

        let timeout = ResilienceError::Timeout(Duration::from_secs(1));
        assert!(timeout.is_retryable());
        assert!(timeout.trips_breaker());

        assert!(!ResilienceError::Cancelled.trips_breaker());
        assert!(!ResilienceError::Cancelled.is_retryable());
    }
}
