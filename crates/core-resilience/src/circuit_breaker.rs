//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a resource
//! is experiencing issues. Outcomes are sampled over a sliding time window and the
//! circuit opens once the window holds enough calls with a high enough failure ratio.
//!
//! States:
//! - Closed: Normal operation, calls pass through
//! - Open: Resource is presumed unhealthy, calls fail immediately
//! - HalfOpen: A single trial call tests whether the resource has recovered
//! - Isolated: Manually held open until [`CircuitBreaker::reset`]

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately until `until`
    Open { until: Instant },
    /// Circuit is half-open, one trial call is admitted
    HalfOpen,
    /// Circuit was opened manually and stays open until reset
    Isolated,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Isolated => "isolated",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerPolicy {
    /// Failure ratio (0.0-1.0] at which the circuit opens
    pub failure_ratio: f64,
    /// Length of the sliding sampling window
    pub sampling_duration: Duration,
    /// Minimum number of calls in the window before the ratio is considered
    pub minimum_throughput: usize,
    /// How long the circuit stays open before admitting a trial call
    pub break_duration: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_duration: Duration::from_secs(60),
            minimum_throughput: 10,
            break_duration: Duration::from_secs(30),
        }
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Outcomes inside the sampling window, oldest first (`true` = failure)
    window: VecDeque<(Instant, bool)>,
    failures: usize,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            failures: 0,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, sampling_duration: Duration) {
        while let Some(&(at, failed)) = self.window.front() {
            if now.duration_since(at) <= sampling_duration {
                break;
            }
            self.window.pop_front();
            if failed {
                self.failures -= 1;
            }
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }
}

/// Sliding-window circuit breaker shared by every call to one resource
///
/// # Example
/// ```
/// use warren_core_resilience::{CircuitBreaker, CircuitBreakerPolicy};
///
/// let breaker = CircuitBreaker::new("broker", CircuitBreakerPolicy::default());
/// let permit = breaker.try_acquire().expect("closed circuit admits calls");
/// permit.record_success();
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    policy: Arc<CircuitBreakerPolicy>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named resource
    pub fn new(name: impl Into<Arc<str>>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
            state: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    /// Resource name this breaker protects
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configured policy
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Number of calls and failures currently inside the sampling window
    pub fn window_counts(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        state.prune(Instant::now(), self.policy.sampling_duration);
        (state.window.len(), state.failures)
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let previous = state.state;
        state.state = CircuitState::Closed;
        state.trial_in_flight = false;
        state.clear_window();
        if previous != CircuitState::Closed {
            info!(resource = %self.name, "Circuit breaker reset to closed");
        }
    }

    /// Hold the circuit open until [`reset`](Self::reset) is called
    pub fn isolate(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Isolated;
        state.trial_in_flight = false;
        error!(resource = %self.name, "Circuit breaker isolated");
    }

    /// Ask the breaker whether a call may proceed
    ///
    /// Fails fast with [`ResilienceError::CircuitOpen`] while the circuit is open,
    /// isolated, or half-open with its single trial call already in flight.
    pub fn try_acquire(&self) -> Result<CallPermit, ResilienceError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open { until } if now >= until => {
                state.state = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                info!(resource = %self.name, "Circuit breaker half-opened");
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                Ok(self.permit(true))
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen | CircuitState::Isolated => {
                Err(ResilienceError::CircuitOpen {
                    resource: self.name.to_string(),
                })
            }
        }
    }

    fn permit(&self, trial: bool) -> CallPermit {
        CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => {
                state.prune(now, self.policy.sampling_duration);
                state.window.push_back((now, false));
            }
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Closed;
                state.trial_in_flight = false;
                state.clear_window();
                info!(resource = %self.name, "Circuit breaker closed");
            }
            // Late results from calls admitted before the circuit opened
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool, reason: &str) {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => {
                state.prune(now, self.policy.sampling_duration);
                state.window.push_back((now, true));
                state.failures += 1;

                let total = state.window.len();
                let ratio = state.failures as f64 / total as f64;
                if total >= self.policy.minimum_throughput && ratio >= self.policy.failure_ratio {
                    state.state = CircuitState::Open {
                        until: now + self.policy.break_duration,
                    };
                    state.clear_window();
                    error!(
                        resource = %self.name,
                        calls = total,
                        failure_ratio = ratio,
                        break_secs = self.policy.break_duration.as_secs_f64(),
                        error = reason,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Open {
                    until: now + self.policy.break_duration,
                };
                state.trial_in_flight = false;
                error!(
                    resource = %self.name,
                    error = reason,
                    "Circuit breaker trial call failed, re-opened"
                );
            }
            _ => {}
        }
    }

    fn on_abandon(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`]
///
/// Dropping a permit without recording an outcome frees a half-open trial slot
/// without counting the call.
#[derive(Debug)]
#[must_use = "record the call outcome on the permit"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed call
    pub fn record_failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker.on_failure(self.trial, reason);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(minimum_throughput: usize, break_duration: Duration) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_ratio: 0.5,
            sampling_duration: Duration::from_secs(10),
            minimum_throughput,
            break_duration,
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().record_failure("test");
    }

    fn succeed(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().record_success();
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new("broker", policy(4, Duration::from_millis(100)));

        succeed(&breaker);
        succeed(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Fourth call reaches minimum throughput with a 50% failure ratio
        fail(&breaker);
        match breaker.state() {
            CircuitState::Open { .. } => (),
            state => panic!("Expected Open state, got {:?}", state),
        }

        let rejected = breaker.try_acquire();
        assert!(matches!(
            rejected,
            Err(ResilienceError::CircuitOpen { ref resource }) if resource == "broker"
        ));
    }

    #[tokio::test]
    async fn test_below_minimum_throughput_stays_closed() {
        let breaker = CircuitBreaker::new("cache", policy(5, Duration::from_millis(100)));
        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.window_counts(), (4, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_outcomes_leave_the_window() {
        let breaker = CircuitBreaker::new("database", policy(3, Duration::from_secs(1)));
        fail(&breaker);
        fail(&breaker);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.window_counts(), (0, 0));

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new("broker", policy(2, Duration::from_secs(5)));
        fail(&breaker);
        fail(&breaker);
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = breaker.try_acquire().expect("trial admitted after break");
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Everyone else is rejected while the trial runs
        assert!(breaker.try_acquire().is_err());

        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.window_counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("broker", policy(1, Duration::from_secs(2)));
        fail(&breaker);

        tokio::time::advance(Duration::from_secs(2)).await;
        breaker.try_acquire().unwrap().record_failure("still down");

        match breaker.state() {
            CircuitState::Open { .. } => (),
            state => panic!("Expected Open state, got {:?}", state),
        }
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = CircuitBreaker::new("broker", policy(1, Duration::from_secs(1)));
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test]
    async fn test_isolate_and_reset() {
        let breaker = CircuitBreaker::new("broker", CircuitBreakerPolicy::default());
        breaker.isolate();
        assert!(breaker.try_acquire().is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
