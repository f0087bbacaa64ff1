//! Retry policy with configurable backoff
//!
//! A [`RetryPolicy`] only computes delays. The pipeline decides when to retry
//! and performs the (cancellable) sleep.

use rand::Rng;
use std::time::Duration;

/// How the delay grows between consecutive retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffType {
    /// Same delay before every retry
    Constant,

    /// Delay grows by `base_delay` per retry
    Linear,

    /// Delay doubles per retry (2^n)
    #[default]
    Exponential,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retry_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffType,

    /// Randomise delays to spread out retries from concurrent callers
    pub use_jitter: bool,

    /// Largest fraction of the delay added as jitter (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffType::Exponential,
            use_jitter: true,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retry_attempts: 0,
            ..Default::default()
        }
    }

    /// Total number of times an operation may run
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Calculate the delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base_delay = match self.backoff {
            BackoffType::Constant => self.base_delay,
            BackoffType::Linear => self.base_delay.saturating_mul(retry),
            BackoffType::Exponential => {
                let multiplier = 2_u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(multiplier)
            }
        };

        let capped_delay = base_delay.min(self.max_delay);

        if self.use_jitter && self.jitter_factor > 0.0 && !capped_delay.is_zero() {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            let jitter_amount = capped_delay.as_secs_f64() * jitter;
            (capped_delay + Duration::from_secs_f64(jitter_amount)).min(self.max_delay)
        } else {
            capped_delay
        }
    }
}
