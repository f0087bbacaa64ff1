//! Load simulation against the in-memory broker
//!
//! Concurrent callers publish through one pool while the broker injects
//! random failures, then the pool, broker and circuit-breaker state is
//! collected into a [`SimulationReport`].

use crate::config::WarrenConfig;
use crate::error::{PoolError, Result};
use crate::memory::{MemoryBroker, MemoryBrokerStats};
use crate::pool::{ConnectionPool, PoolStats};
use crate::publisher::{PublishError, QueuePublisher};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Knobs for one simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Concurrent callers
    pub callers: usize,
    /// Publishes per caller
    pub operations: usize,
    /// Probability that a connect or publish fails
    pub failure_rate: f64,
    /// Broker-side latency of each publish
    pub op_latency: Duration,
    pub queue: String,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            callers: 8,
            operations: 50,
            failure_rate: 0.0,
            op_latency: Duration::from_millis(5),
            queue: "simulation".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: u64,
    pub failed: u64,
    /// Calls rejected by an open circuit without reaching the broker
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub outcomes: OutcomeCounts,
    pub elapsed_ms: u64,
    /// Circuit state of the broker pipeline at the end of the run
    pub circuit_state: &'static str,
    pub pool: PoolStats,
    pub broker: MemoryBrokerStats,
    /// Messages left in the simulation queue
    pub queued_messages: usize,
}

/// Drive `options.callers` concurrent publishers against a fresh in-memory broker
pub async fn run_simulation(
    config: &WarrenConfig,
    options: &SimulationOptions,
    cancel: &CancellationToken,
) -> Result<SimulationReport> {
    if options.callers == 0 {
        return Err(PoolError::Config("callers must be at least 1".into()));
    }

    let broker = MemoryBroker::new();
    broker.set_failure_rate(options.failure_rate);
    broker.set_publish_latency(options.op_latency);

    let registry = config.pipeline_registry();
    let pool = Arc::new(ConnectionPool::from_registry(
        broker.clone(),
        config.pool_config(),
        &registry,
    )?);
    let publisher = Arc::new(QueuePublisher::new(pool.clone()));

    info!(
        callers = options.callers,
        operations = options.operations,
        failure_rate = options.failure_rate,
        "Starting simulation"
    );
    let started = tokio::time::Instant::now();

    let mut callers = JoinSet::new();
    for caller in 0..options.callers {
        let publisher = publisher.clone();
        let cancel = cancel.clone();
        let queue = options.queue.clone();
        let operations = options.operations;

        callers.spawn(async move {
            let mut counts = OutcomeCounts::default();
            for sequence in 0..operations {
                let message = SimulatedMessage { caller, sequence };
                match publisher.publish(&cancel, &message, &queue).await {
                    Ok(_) => counts.succeeded += 1,
                    Err(PublishError::Pool(PoolError::CircuitOpen { .. })) => counts.rejected += 1,
                    Err(PublishError::Pool(PoolError::Cancelled)) => break,
                    Err(e) => {
                        debug!(caller, sequence, error = %e, "Simulated publish failed");
                        counts.failed += 1;
                    }
                }
            }
            counts
        });
    }

    let mut outcomes = OutcomeCounts::default();
    while let Some(joined) = callers.join_next().await {
        let counts = joined?;
        outcomes.succeeded += counts.succeeded;
        outcomes.failed += counts.failed;
        outcomes.rejected += counts.rejected;
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let circuit_state = pool.pipeline().breaker().state().name();
    let pool_stats = pool.stats();
    pool.shutdown().await;

    info!(
        succeeded = outcomes.succeeded,
        failed = outcomes.failed,
        rejected = outcomes.rejected,
        elapsed_ms,
        "Simulation finished"
    );

    Ok(SimulationReport {
        outcomes,
        elapsed_ms,
        circuit_state,
        pool: pool_stats,
        queued_messages: broker.queue_len(&options.queue).unwrap_or(0),
        broker: broker.stats(),
    })
}

#[derive(Serialize)]
struct SimulatedMessage {
    caller: usize,
    sequence: usize,
}
