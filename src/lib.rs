/*!
 * Warren - resilient connection and channel pooling for message brokers
 *
 * - Bounded pool of physical broker connections, each multiplexing a
 *   bounded set of reusable channels
 * - Idle connection reuse, staleness eviction and a periodic health sweep
 * - Retry, circuit-breaker and timeout protection via named resilience
 *   pipelines (`warren-core-resilience`)
 * - Pooled JSON publishing and acknowledged consumption
 * - TOML configuration, structured logging, and an in-memory broker for
 *   tests and simulation
 */

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod publisher;
pub mod report;
pub mod simulate;

// Re-export commonly used types
pub use broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionFactory, ConsumeChannel, Delivery,
    PublishChannel, QueueChannel,
};
pub use config::WarrenConfig;
pub use consumer::QueueConsumer;
pub use error::{PoolError, Result};
pub use pool::{ChannelLease, ConnectionLease, ConnectionPool, PoolConfig, PoolStats};
pub use publisher::QueuePublisher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
