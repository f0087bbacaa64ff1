/*!
 * Error types for Warren
 */

use crate::broker::BrokerError;
use std::time::Duration;
use thiserror::Error;
use warren_core_resilience::{Recoverable, ResilienceError};

pub type Result<T> = std::result::Result<T, PoolError>;

/// Failures surfaced by the connection pool and its callers' pipelines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Acquiring a connection or channel took longer than its configured wait
    #[error("Timed out after {waited:?} waiting for a {resource}")]
    ResourceTimeout {
        resource: &'static str,
        waited: Duration,
    },

    /// The resilience pipeline rejected the call without running it
    #[error("Circuit breaker for '{resource}' is open")]
    CircuitOpen { resource: String },

    /// The wrapped operation exceeded its timeout
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// The pool or connection has been shut down
    #[error("The {0} has been disposed")]
    ResourceDisposed(&'static str),

    /// The caller cancelled the wait
    #[error("Operation was cancelled")]
    Cancelled,

    /// Broker client failure
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A spawned task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl PoolError {
    pub(crate) fn connection_timeout(waited: Duration) -> Self {
        PoolError::ResourceTimeout {
            resource: "connection",
            waited,
        }
    }

    pub(crate) fn channel_timeout(waited: Duration) -> Self {
        PoolError::ResourceTimeout {
            resource: "channel",
            waited,
        }
    }

    /// Check if this error is fatal to the call (never worth retrying)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::ResourceDisposed(_)
                | PoolError::Config(_)
                | PoolError::Cancelled
                | PoolError::TaskFailed(_)
        )
    }
}

impl From<tokio::task::JoinError> for PoolError {
    fn from(error: tokio::task::JoinError) -> Self {
        PoolError::TaskFailed(error.to_string())
    }
}

impl From<ResilienceError> for PoolError {
    fn from(error: ResilienceError) -> Self {
        match error {
            ResilienceError::CircuitOpen { resource } => PoolError::CircuitOpen { resource },
            ResilienceError::Timeout(after) => PoolError::OperationTimeout(after),
            ResilienceError::Cancelled => PoolError::Cancelled,
            ResilienceError::UnknownPipeline(name) => {
                PoolError::Config(format!("no resilience pipeline named '{name}'"))
            }
            ResilienceError::Transient(msg) => PoolError::Broker(BrokerError::Io(msg)),
            ResilienceError::Permanent(msg) => PoolError::Broker(BrokerError::Protocol(msg)),
        }
    }
}

impl Recoverable for PoolError {
    fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, PoolError::CircuitOpen { .. })
    }

    fn trips_breaker(&self) -> bool {
        !self.is_fatal() && !matches!(self, PoolError::CircuitOpen { .. })
    }
}
