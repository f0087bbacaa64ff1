//! Warren Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the policy layer that shields every interaction with a
//! networked resource (message broker, cache, database) from transient failures
//! and cascading overload. It includes:
//!
//! - **Retry**: Bounded retries with constant, linear or exponential backoff and jitter
//! - **Circuit Breaker**: Sliding-window failure-ratio breaker with a single half-open trial
//! - **Timeout**: Per-attempt upper bound that counts as a breaker failure
//! - **Pipeline**: The three composed into one named, reusable execution wrapper
//! - **Registry**: Pipelines built once at startup and looked up by resource name
//!
//! # Key Principles
//!
//! This crate is **pure policy** with zero knowledge of:
//! - Broker, cache or database clients
//! - Connection or channel lifecycles
//! - Application-specific error types (classified through [`Recoverable`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Caller                          │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry                             │  ← Backoff + jitter between attempts
//! │  (Stops on non-retryable / open circuit)│
//! └─────────────┬───────────────────────────┘
//!               │ every attempt
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Failure ratio over sampling window)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Timeout                           │  ← Bounded attempt duration
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Resource
//!      (Broker, Cache, Database)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use warren_core_resilience::{
//!     PipelineOptions, PipelineRegistry, ResilienceError, BROKER,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let registry = PipelineRegistry::builder()
//!     .with_pipeline(BROKER, PipelineOptions::default())
//!     .build();
//!
//! let pipeline = registry.get(BROKER)?;
//! let cancel = CancellationToken::new();
//! let result = pipeline
//!     .execute(&cancel, || async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerPolicy, CircuitState};
pub use error::{Recoverable, ResilienceError};
pub use pipeline::{PipelineOptions, ResiliencePipeline};
pub use registry::{PipelineRegistry, PipelineRegistryBuilder, BROKER, CACHE, DATABASE};
pub use retry::{BackoffType, RetryPolicy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use warren_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerPolicy, CircuitState};
    pub use super::error::{Recoverable, ResilienceError};
    pub use super::pipeline::{PipelineOptions, ResiliencePipeline};
    pub use super::registry::{PipelineRegistry, BROKER, CACHE, DATABASE};
    pub use super::retry::{BackoffType, RetryPolicy};
}
