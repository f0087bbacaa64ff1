//! Resilience pipeline: retry → circuit breaker → timeout
//!
//! Each attempt asks the breaker for admission, runs under the per-attempt
//! timeout and records its outcome. Failed attempts are retried with backoff
//! until the retry budget is spent, the error is not retryable, or the breaker
//! opens. Waits are cancellable and never block a worker thread.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerPolicy};
use crate::error::{Recoverable, ResilienceError};
use crate::retry::RetryPolicy;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything needed to build one [`ResiliencePipeline`]
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Named, reusable execution wrapper for one downstream resource
///
/// # Example
/// ```no_run
/// use warren_core_resilience::{PipelineOptions, ResilienceError, ResiliencePipeline};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pipeline = ResiliencePipeline::new("cache", PipelineOptions::default());
/// let cancel = CancellationToken::new();
///
/// let value = pipeline
///     .execute(&cancel, || async { Ok::<_, ResilienceError>(42) })
///     .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ResiliencePipeline {
    name: Arc<str>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl ResiliencePipeline {
    /// Build a pipeline for the named resource
    pub fn new(name: impl Into<Arc<str>>, options: PipelineOptions) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), options.circuit_breaker),
            retry: options.retry,
            timeout: options.timeout,
            name,
        }
    }

    /// Resource name this pipeline protects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The circuit breaker shared by every call through this pipeline
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `op` without an external cancellation signal
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Recoverable + Display,
    {
        self.execute(&CancellationToken::new(), op).await
    }

    /// Execute `op` with retry, circuit-breaker and timeout protection
    ///
    /// Returns the last error once retries are exhausted,
    /// [`ResilienceError::CircuitOpen`] without running `op` when the breaker
    /// rejects the attempt, and [`ResilienceError::Cancelled`] as soon as
    /// `cancel` fires.
    pub async fn execute<T, E, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Recoverable + Display,
    {
        let mut retry = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled.into());
            }

            let permit = self.breaker.try_acquire()?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(permit);
                    return Err(ResilienceError::Cancelled.into());
                }
                outcome = tokio::time::timeout(self.timeout, op()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => {
                    permit.record_success();
                    if retry > 0 {
                        debug!(resource = %self.name, retries = retry, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => E::from(ResilienceError::Timeout(self.timeout)),
            };

            if error.trips_breaker() {
                permit.record_failure(&error.to_string());
            } else {
                drop(permit);
            }

            if !error.is_retryable() || retry >= self.retry.max_retry_attempts {
                return Err(error);
            }

            retry += 1;
            let delay = self.retry.delay_for(retry);
            warn!(
                resource = %self.name,
                attempt = retry,
                max_attempts = self.retry.max_retry_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
