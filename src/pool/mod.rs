//! Connection and channel pooling

mod connection_pool;
mod lease;
mod pooled_connection;
mod stats;

pub use connection_pool::{ConnectionPool, PoolConfig, SweepReport};
pub use lease::{ChannelLease, ChannelOf, ConnectionLease};
pub use pooled_connection::{ConnectionId, PooledConnection};
pub use stats::PoolStats;
