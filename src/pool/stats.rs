//! Pool statistics and lifetime counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the pool and its connections
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub connections_created: AtomicU64,
    pub connections_reused: AtomicU64,
    pub connections_disposed: AtomicU64,
    pub channels_created: AtomicU64,
    pub channels_reused: AtomicU64,
    pub channels_discarded: AtomicU64,
    pub health_sweeps: AtomicU64,
    pub sweep_evictions: AtomicU64,
}

impl PoolCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections waiting in the available queue
    pub idle: usize,
    /// Connections serving channels or leased whole
    pub active: usize,
    /// Total connections (idle + active)
    pub total: usize,
    /// Configured connection limit
    pub max_connections: usize,
    /// Capacity permits not held by any connection
    pub available_permits: usize,
    /// Channels currently checked out across all connections
    pub channels_in_use: usize,
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_disposed: u64,
    pub channels_created: u64,
    pub channels_reused: u64,
    pub channels_discarded: u64,
    pub health_sweeps: u64,
    pub sweep_evictions: u64,
}

impl PoolStats {
    pub(crate) fn with_counters(mut self, counters: &PoolCounters) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        self.connections_created = load(&counters.connections_created);
        self.connections_reused = load(&counters.connections_reused);
        self.connections_disposed = load(&counters.connections_disposed);
        self.channels_created = load(&counters.channels_created);
        self.channels_reused = load(&counters.channels_reused);
        self.channels_discarded = load(&counters.channels_discarded);
        self.health_sweeps = load(&counters.health_sweeps);
        self.sweep_evictions = load(&counters.sweep_evictions);
        self
    }

    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_connections as f64) * 100.0
        }
    }
}
