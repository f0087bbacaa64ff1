//! Bounded pool of broker connections with per-connection channel sub-pools
//!
//! The pool admits at most `max_connections` physical connections through a
//! capacity semaphore. A permit is owned by the connection it admitted and is
//! released when that connection is disposed, so the permit count always
//! matches the number of live connections. Callers wait for capacity, for an
//! idle connection to come back, or for a channel slot on a shared connection.

use super::lease::{ChannelClaim, ChannelLease, ChannelOf, Conn, ConnectionLease};
use super::pooled_connection::{ConnectionId, Placement, PooledConnection};
use super::stats::{PoolCounters, PoolStats};
use crate::broker::{BrokerConnection, ConnectionFactory};
use crate::error::{PoolError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warren_core_resilience::{PipelineRegistry, Recoverable, ResilienceError, ResiliencePipeline, BROKER};

/// Configuration for connection pool behavior
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of physical connections
    pub max_connections: usize,
    /// Maximum concurrently issued channels per connection
    pub max_channels_per_connection: usize,
    /// Bound on obtaining a connection, including creating one
    pub connection_timeout: Duration,
    /// Bound on waiting for a channel slot
    pub channel_timeout: Duration,
    /// Period of the background health sweep
    pub health_check_interval: Duration,
    pub enable_health_checks: bool,
    /// A connection unused for this long is considered stale
    pub idle_timeout: Duration,
    /// Bound on closing one connection during disposal
    pub dispose_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            max_channels_per_connection: 10,
            connection_timeout: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(120),
            enable_health_checks: true,
            idle_timeout: Duration::from_secs(30 * 60),
            dispose_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(PoolError::Config("max_connections must be at least 1".into()));
        }
        if self.max_channels_per_connection == 0 {
            return Err(PoolError::Config(
                "max_channels_per_connection must be at least 1".into(),
            ));
        }
        let durations = [
            ("connection_timeout", self.connection_timeout),
            ("channel_timeout", self.channel_timeout),
            ("idle_timeout", self.idle_timeout),
            ("dispose_timeout", self.dispose_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(PoolError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.enable_health_checks && self.health_check_interval.is_zero() {
            return Err(PoolError::Config(
                "health_check_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one health sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections examined, idle and checked out
    pub inspected: usize,
    /// Connections found unhealthy and disposed
    pub evicted: usize,
}

/// How a missing connection gets opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connect {
    /// Through the pool's resilience pipeline
    Resilient,
    /// One attempt bounded by the pipeline timeout, for callers already
    /// running inside that pipeline
    Direct,
}

/// Shared pool state; leases keep it alive after the handle is dropped
pub(crate) struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    pipeline: Arc<ResiliencePipeline>,
    available: Mutex<VecDeque<Conn<F>>>,
    active: DashMap<ConnectionId, Conn<F>>,
    capacity: Arc<Semaphore>,
    returned: Notify,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    counters: Arc<PoolCounters>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            Err(PoolError::ResourceDisposed("connection pool"))
        } else {
            Ok(())
        }
    }

    /// Put a connection that just went idle back in the available queue
    pub(crate) fn check_in(&self, conn: &Conn<F>) {
        self.active.remove(conn.id());
        {
            let mut available = self.available.lock();
            if !self.is_disposed() {
                available.push_back(conn.clone());
                drop(available);
                debug!(connection_id = %conn.id(), "Connection returned to idle queue");
                self.returned.notify_waiters();
                return;
            }
        }
        self.spawn_dispose(conn.clone());
    }

    /// Remove an unhealthy connection and dispose it in the background
    pub(crate) fn retire(&self, conn: &Conn<F>) {
        self.active.remove(conn.id());
        if !self.is_disposed() {
            warn!(connection_id = %conn.id(), "Disposing unhealthy connection");
        }
        self.spawn_dispose(conn.clone());
    }

    fn spawn_dispose(&self, conn: Conn<F>) {
        let timeout = self.config.dispose_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(dispose_bounded(conn, timeout));
            }
            Err(_) => conn.release_capacity(),
        }
    }

    fn try_reserve(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match self.capacity.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolError::ResourceDisposed("connection pool")),
        }
    }

    /// Wait until capacity frees up (`Some`) or an idle connection is
    /// returned (`None`)
    async fn wait_for_capacity(
        &self,
        cancel: &CancellationToken,
        returned: Pin<&mut Notified<'_>>,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            _ = self.shutdown.cancelled() => Err(PoolError::ResourceDisposed("connection pool")),
            _ = returned => Ok(None),
            permit = self.capacity.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|_| PoolError::ResourceDisposed("connection pool")),
        }
    }

    /// Pop the first healthy idle connection, disposing stale ones on the way
    fn take_idle(&self, placement: Placement) -> Option<Conn<F>> {
        loop {
            let conn = self.available.lock().pop_front()?;

            if conn.is_healthy() && conn.activate(placement) {
                self.active.insert(conn.id().to_string(), conn.clone());
                if self.is_disposed() {
                    self.active.remove(conn.id());
                    self.spawn_dispose(conn);
                    return None;
                }
                PoolCounters::bump(&self.counters.connections_reused);
                debug!(connection_id = %conn.id(), "Reusing idle connection");
                return Some(conn);
            }

            warn!(connection_id = %conn.id(), "Discarding unhealthy idle connection");
            self.spawn_dispose(conn);
        }
    }

    /// Open a connection and admit it with `permit`
    async fn open_connection(
        &self,
        permit: OwnedSemaphorePermit,
        placement: Placement,
        connect: Connect,
        cancel: &CancellationToken,
    ) -> Result<Conn<F>> {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            created = self.create_raw(connect) => created
                .inspect_err(|e| error!(error = %e, "Failed to create broker connection"))?,
        };

        let conn = Arc::new(
            PooledConnection::new(
                raw,
                self.config.max_channels_per_connection,
                self.config.idle_timeout,
            )
            .with_counters(self.counters.clone())
            .with_capacity_permit(permit),
        );
        conn.activate(placement);
        self.active.insert(conn.id().to_string(), conn.clone());

        if self.is_disposed() {
            self.active.remove(conn.id());
            self.spawn_dispose(conn);
            return Err(PoolError::ResourceDisposed("connection pool"));
        }

        PoolCounters::bump(&self.counters.connections_created);
        info!(
            connection_id = %conn.id(),
            total = self.connection_count(),
            max = self.config.max_connections,
            "Created new broker connection"
        );
        Ok(conn)
    }

    async fn create_raw(&self, connect: Connect) -> Result<F::Connection> {
        let factory = &self.factory;
        match connect {
            Connect::Resilient => {
                self.pipeline
                    .execute(&self.shutdown, move || async move {
                        factory.create_connection().await.map_err(PoolError::from)
                    })
                    .await
            }
            Connect::Direct => {
                let limit = self.pipeline.timeout();
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => Err(PoolError::ResourceDisposed("connection pool")),
                    created = tokio::time::timeout(limit, factory.create_connection()) => match created {
                        Ok(created) => created.map_err(PoolError::from),
                        Err(_) => Err(PoolError::OperationTimeout(limit)),
                    },
                }
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.available.lock().len() + self.active.len()
    }

    /// Shared connections ordered by load, lightest first
    fn shared_connections(&self) -> Vec<Conn<F>> {
        let mut shared: Vec<Conn<F>> = self
            .active
            .iter()
            .filter(|entry| entry.value().placement() == Placement::Shared)
            .map(|entry| entry.value().clone())
            .collect();
        shared.sort_by_key(|conn| conn.active_channel_count());
        shared
    }

    /// Check out a whole connection
    async fn acquire_leased(&self, cancel: &CancellationToken) -> Result<Conn<F>> {
        loop {
            self.ensure_open()?;
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if let Some(conn) = self.take_idle(Placement::Leased) {
                return Ok(conn);
            }
            if let Some(permit) = self.try_reserve()? {
                return self
                    .open_connection(permit, Placement::Leased, Connect::Resilient, cancel)
                    .await;
            }
            if let Some(permit) = self.wait_for_capacity(cancel, returned).await? {
                return self
                    .open_connection(permit, Placement::Leased, Connect::Resilient, cancel)
                    .await;
            }
        }
    }

    /// Claim a connection to take a channel from
    ///
    /// Preference: an idle connection, the least loaded shared connection with
    /// a free channel slot, a new connection, any shared connection (the caller
    /// then waits for a slot), and finally waiting for capacity.
    async fn claim_connection(
        self: &Arc<Self>,
        connect: Connect,
        cancel: &CancellationToken,
    ) -> Result<ChannelClaim<F>> {
        loop {
            self.ensure_open()?;
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if let Some(conn) = self.take_idle(Placement::Shared) {
                return Ok(ChannelClaim::new(self.clone(), conn));
            }

            let shared = self.shared_connections();
            if let Some(conn) = shared
                .iter()
                .filter(|conn| conn.available_channel_slots() > 0)
                .find(|conn| conn.try_claim())
            {
                return Ok(ChannelClaim::new(self.clone(), conn.clone()));
            }

            if let Some(permit) = self.try_reserve()? {
                let conn = self
                    .open_connection(permit, Placement::Shared, connect, cancel)
                    .await?;
                return Ok(ChannelClaim::new(self.clone(), conn));
            }

            if let Some(conn) = shared.iter().find(|conn| conn.try_claim()) {
                return Ok(ChannelClaim::new(self.clone(), conn.clone()));
            }

            if let Some(permit) = self.wait_for_capacity(cancel, returned).await? {
                let conn = self
                    .open_connection(permit, Placement::Shared, connect, cancel)
                    .await?;
                return Ok(ChannelClaim::new(self.clone(), conn));
            }
        }
    }

    /// Dispose idle and checked-out connections that are closed or stale
    async fn sweep(&self) -> SweepReport {
        let (idle_count, mut stale) = {
            let mut available = self.available.lock();
            let inspected = available.len();
            let mut stale = Vec::new();
            available.retain(|conn| {
                let healthy = conn.is_healthy();
                if !healthy {
                    stale.push(conn.clone());
                }
                healthy
            });
            (inspected, stale)
        };

        let active_count = self.active.len();
        let retiring: Vec<Conn<F>> = self
            .active
            .iter()
            .filter(|entry| entry.value().retire_if_unhealthy())
            .map(|entry| entry.value().clone())
            .collect();
        for conn in retiring {
            self.active.remove(conn.id());
            stale.push(conn);
        }

        PoolCounters::bump(&self.counters.health_sweeps);
        let inspected = idle_count + active_count;
        let evicted = stale.len();
        if evicted > 0 {
            PoolCounters::add(&self.counters.sweep_evictions, evicted as u64);
            for conn in &stale {
                warn!(connection_id = %conn.id(), "Removing unhealthy connection");
            }
            let timeout = self.config.dispose_timeout;
            futures::future::join_all(stale.into_iter().map(|c| dispose_bounded(c, timeout))).await;
            info!(evicted, inspected, "Health check removed unhealthy connections");
        } else {
            debug!(inspected, "Health check found no unhealthy connections");
        }

        SweepReport { inspected, evicted }
    }

    async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disposing connection pool");
        self.shutdown.cancel();
        self.capacity.close();

        let mut connections: Vec<Conn<F>> = self.available.lock().drain(..).collect();
        let ids: Vec<ConnectionId> = self.active.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, conn)) = self.active.remove(&id) {
                connections.push(conn);
            }
        }

        let count = connections.len();
        let timeout = self.config.dispose_timeout;
        futures::future::join_all(connections.into_iter().map(|c| dispose_bounded(c, timeout))).await;
        info!(connections = count, "Connection pool disposed");
    }

    fn stats(&self) -> PoolStats {
        let (idle, mut channels_in_use) = {
            let available = self.available.lock();
            let channels: usize = available.iter().map(|c| c.active_channel_count()).sum();
            (available.len(), channels)
        };
        let active = self.active.len();
        channels_in_use += self
            .active
            .iter()
            .map(|entry| entry.value().active_channel_count())
            .sum::<usize>();

        PoolStats {
            idle,
            active,
            total: idle + active,
            max_connections: self.config.max_connections,
            available_permits: self.capacity.available_permits(),
            channels_in_use,
            ..PoolStats::default()
        }
        .with_counters(&self.counters)
    }
}

async fn dispose_bounded<C: BrokerConnection>(
    conn: Arc<PooledConnection<C>>,
    timeout: Duration,
) {
    if tokio::time::timeout(timeout, conn.dispose()).await.is_err() {
        error!(connection_id = %conn.id(), ?timeout, "Timed out disposing connection");
        conn.release_capacity();
    }
}

/// Periodically sweep the pool until it shuts down
fn spawn_sweeper<F: ConnectionFactory>(inner: &Arc<PoolInner<F>>) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No tokio runtime available, connection health checks disabled");
            return;
        }
    };

    let pool: Weak<PoolInner<F>> = Arc::downgrade(inner);
    let stop = inner.shutdown.clone();
    let period = inner.config.health_check_interval;

    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    pool.sweep().await;
                }
            }
        }
        debug!("Connection health check task stopped");
    });
}

/// Bounded, resilient pool of broker connections and channels
///
/// # Example
/// ```no_run
/// use warren::memory::MemoryBroker;
/// use warren::pool::{ConnectionPool, PoolConfig};
/// use warren_core_resilience::{PipelineOptions, ResiliencePipeline};
/// use std::sync::Arc;
///
/// # async fn example() -> warren::Result<()> {
/// let pipeline = Arc::new(ResiliencePipeline::new("broker", PipelineOptions::default()));
/// let pool = ConnectionPool::new(MemoryBroker::new(), PoolConfig::default(), pipeline)?;
///
/// let channel = pool.get_channel().await?;
/// // Use channel...
/// pool.return_channel(channel);
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool that opens connections through `pipeline`
    ///
    /// Starts the background health sweep when enabled and a tokio runtime is
    /// available.
    pub fn new(factory: F, config: PoolConfig, pipeline: Arc<ResiliencePipeline>) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            capacity: Arc::new(Semaphore::new(config.max_connections)),
            factory,
            pipeline,
            available: Mutex::new(VecDeque::new()),
            active: DashMap::new(),
            returned: Notify::new(),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            counters: Arc::default(),
            config,
        });

        if inner.config.enable_health_checks {
            spawn_sweeper(&inner);
        }

        info!(
            max_connections = inner.config.max_connections,
            max_channels = inner.config.max_channels_per_connection,
            "Connection pool initialised"
        );
        Ok(Self { inner })
    }

    /// Create a pool using the registry's `broker` pipeline
    pub fn from_registry(factory: F, config: PoolConfig, registry: &PipelineRegistry) -> Result<Self> {
        let pipeline = registry.get(BROKER)?;
        Self::new(factory, config, pipeline)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Pipeline used for connection creation and `execute_with_channel`
    pub fn pipeline(&self) -> &Arc<ResiliencePipeline> {
        &self.inner.pipeline
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Check out a whole connection
    pub async fn get_connection(&self) -> Result<ConnectionLease<F>> {
        self.get_connection_with(&CancellationToken::new()).await
    }

    /// Check out a whole connection, giving up when `cancel` fires
    ///
    /// Reuses a healthy idle connection when one exists, otherwise opens a new
    /// one if capacity allows, otherwise waits. The whole wait is bounded by
    /// `connection_timeout`.
    pub async fn get_connection_with(&self, cancel: &CancellationToken) -> Result<ConnectionLease<F>> {
        let timeout = self.inner.config.connection_timeout;
        let conn = tokio::time::timeout(timeout, self.inner.acquire_leased(cancel))
            .await
            .map_err(|_| PoolError::connection_timeout(timeout))??;
        Ok(ConnectionLease::new(self.inner.clone(), conn))
    }

    /// Return a whole connection; unhealthy connections are disposed
    pub fn return_connection(&self, lease: ConnectionLease<F>) {
        drop(lease);
    }

    /// Check out a channel
    pub async fn get_channel(&self) -> Result<ChannelLease<F>> {
        self.get_channel_with(&CancellationToken::new()).await
    }

    /// Check out a channel, giving up when `cancel` fires
    ///
    /// Obtaining the connection is bounded by `connection_timeout`, waiting for
    /// a channel slot on it by `channel_timeout`.
    ///
    /// A claimed connection that dies while the caller waits for its slot is
    /// given up and the caller claims another one, within what is left of
    /// `connection_timeout`.
    pub async fn get_channel_with(&self, cancel: &CancellationToken) -> Result<ChannelLease<F>> {
        self.checkout_channel(Connect::Resilient, cancel).await
    }

    async fn checkout_channel(
        &self,
        connect: Connect,
        cancel: &CancellationToken,
    ) -> Result<ChannelLease<F>> {
        let timeout = self.inner.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let claim = tokio::time::timeout_at(deadline, self.inner.claim_connection(connect, cancel))
                .await
                .map_err(|_| PoolError::connection_timeout(timeout))??;

            let checkout = match claim
                .connection()
                .get_channel(self.inner.config.channel_timeout, cancel)
                .await
            {
                Ok(checkout) => checkout,
                Err(e) if self.is_dead_claim(&claim, &e) => {
                    debug!(connection_id = %claim.connection().id(), error = %e, "Claimed connection died, claiming another");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !claim.connection().is_healthy() && !self.inner.is_disposed() {
                debug!(connection_id = %claim.connection().id(), "Claimed connection went unhealthy, claiming another");
                drop(ChannelLease::new(checkout, claim));
                continue;
            }

            debug!(
                connection_id = %claim.connection().id(),
                channel_id = checkout.id(),
                "Checked out channel"
            );
            return Ok(ChannelLease::new(checkout, claim));
        }
    }

    /// The claimed connection failed under the caller while the pool stays open
    fn is_dead_claim(&self, claim: &ChannelClaim<F>, error: &PoolError) -> bool {
        if self.inner.is_disposed() || matches!(error, PoolError::Cancelled) {
            return false;
        }
        let conn = claim.connection();
        conn.is_disposed() || !conn.is_healthy()
    }

    /// Return a channel to the connection that issued it
    pub fn return_channel(&self, lease: ChannelLease<F>) {
        drop(lease);
    }

    /// Run `op` on a pooled channel under the pool's resilience pipeline
    pub async fn execute_with_channel<T, E, Op, Fut>(&self, op: Op) -> std::result::Result<T, E>
    where
        Op: Fn(ChannelOf<F>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<PoolError> + Recoverable + fmt::Display,
    {
        self.execute_with_channel_with(&CancellationToken::new(), op).await
    }

    /// Run `op` on a pooled channel, giving up when `cancel` fires
    ///
    /// Every attempt checks out a fresh channel and returns it whatever the
    /// outcome, including when the attempt times out or is cancelled. A
    /// connection opened for an attempt counts toward that attempt alone; it
    /// is not admitted by the circuit breaker a second time.
    pub async fn execute_with_channel_with<T, E, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        op: Op,
    ) -> std::result::Result<T, E>
    where
        Op: Fn(ChannelOf<F>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<PoolError> + Recoverable + fmt::Display,
    {
        let pool = self;
        let op = &op;
        self.inner
            .pipeline
            .execute(cancel, move || async move {
                let lease = pool
                    .checkout_channel(Connect::Direct, cancel)
                    .await
                    .map_err(Attempt::Pool)?;
                let result = op(lease.channel().clone()).await.map_err(Attempt::Operation);
                pool.return_channel(lease);
                result
            })
            .await
            .map_err(Attempt::into_inner)
    }

    /// Run one health sweep now
    pub async fn run_health_check(&self) -> SweepReport {
        self.inner.sweep().await
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Stop the health sweep, wake every waiter with
    /// [`PoolError::ResourceDisposed`] and dispose every connection
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner.shutdown.cancel();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.shutdown().await });
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("pipeline", &self.inner.pipeline.name())
            .field("disposed", &self.inner.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Failure of one `execute_with_channel` attempt
enum Attempt<E> {
    Pool(PoolError),
    Operation(E),
}

impl<E: From<PoolError>> Attempt<E> {
    fn into_inner(self) -> E {
        match self {
            Attempt::Pool(e) => E::from(e),
            Attempt::Operation(e) => e,
        }
    }
}

impl<E> From<ResilienceError> for Attempt<E> {
    fn from(error: ResilienceError) -> Self {
        Attempt::Pool(PoolError::from(error))
    }
}

impl<E: Recoverable> Recoverable for Attempt<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Attempt::Pool(e) => e.is_retryable(),
            Attempt::Operation(e) => e.is_retryable(),
        }
    }

    fn trips_breaker(&self) -> bool {
        match self {
            Attempt::Pool(e) => e.trips_breaker(),
            Attempt::Operation(e) => e.trips_breaker(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Attempt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Pool(e) => e.fmt(f),
            Attempt::Operation(e) => e.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerChannel, BrokerError};
    use crate::memory::MemoryBroker;
    use std::sync::atomic::AtomicUsize;
    use warren_core_resilience::{BackoffType, CircuitBreakerPolicy, PipelineOptions, RetryPolicy};

    fn test_pipeline() -> Arc<ResiliencePipeline> {
        Arc::new(ResiliencePipeline::new(
            BROKER,
            PipelineOptions {
                retry: RetryPolicy {
                    max_retry_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    backoff: BackoffType::Constant,
                    use_jitter: false,
                    jitter_factor: 0.0,
                },
                circuit_breaker: CircuitBreakerPolicy {
                    minimum_throughput: 1000,
                    ..CircuitBreakerPolicy::default()
                },
                timeout: Duration::from_secs(5),
            },
        ))
    }

    fn config(max_connections: usize, max_channels: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            max_channels_per_connection: max_channels,
            connection_timeout: Duration::from_secs(2),
            channel_timeout: Duration::from_secs(2),
            enable_health_checks: false,
            ..PoolConfig::default()
        }
    }

    fn pool(broker: &MemoryBroker, config: PoolConfig) -> ConnectionPool<MemoryBroker> {
        ConnectionPool::new(broker.clone(), config, test_pipeline()).unwrap()
    }

    /// Let spawned disposals finish
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());

        let zero = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(zero.validate(), Err(PoolError::Config(_))));

        let no_wait = PoolConfig {
            channel_timeout: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(matches!(no_wait.validate(), Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_channel_checkout_reuses_connection() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(5, 10));

        let first = pool.get_channel().await.unwrap();
        let conn_id = first.connection_id().to_string();
        let channel_id = first.channel_id();
        pool.return_channel(first);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.channels_in_use, 0);

        let second = pool.get_channel().await.unwrap();
        assert_eq!(second.connection_id(), conn_id);
        assert_eq!(second.channel_id(), channel_id);

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.connections_reused, 1);
        assert_eq!(stats.channels_reused, 1);
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_channels_share_one_connection_until_full() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool(&broker, config(1, 2)));

        let a = pool.get_channel().await.unwrap();
        let b = pool.get_channel().await.unwrap();
        assert_eq!(a.connection_id(), b.connection_id());
        assert_ne!(a.channel_id(), b.channel_id());

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.channels_in_use, 2);
        assert_eq!(stats.available_permits, 0);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.get_channel().await?;
                Ok::<_, PoolError>(lease.connection_id().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let expected = a.connection_id().to_string();
        pool.return_channel(a);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, expected);
        drop(b);
        assert_eq!(pool.stats().channels_in_use, 0);
    }

    #[tokio::test]
    async fn test_channel_wait_times_out() {
        let broker = MemoryBroker::new();
        let pool = pool(
            &broker,
            PoolConfig {
                channel_timeout: Duration::from_millis(100),
                ..config(1, 2)
            },
        );

        let _a = pool.get_channel().await.unwrap();
        let _b = pool.get_channel().await.unwrap();

        let result = pool.get_channel().await;
        assert!(matches!(
            result,
            Err(PoolError::ResourceTimeout { resource: "channel", .. })
        ));
        assert_eq!(pool.stats().channels_in_use, 2);
    }

    #[tokio::test]
    async fn test_hanging_factory_times_out_without_leaking_capacity() {
        let broker = MemoryBroker::new();
        broker.set_hang_connects(true);
        let pool = pool(
            &broker,
            PoolConfig {
                connection_timeout: Duration::from_millis(100),
                ..config(1, 2)
            },
        );

        let result = pool.get_channel().await;
        assert_eq!(
            result.err(),
            Some(PoolError::connection_timeout(Duration::from_millis(100)))
        );

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available_permits, 1);

        broker.set_hang_connects(false);
        assert!(pool.get_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_waiter_wakes_on_return() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool(&broker, config(1, 2)));

        let lease = pool.get_connection().await.unwrap();
        let held_id = lease.id().to_string();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.get_connection().await?;
                Ok::<_, PoolError>(lease.id().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.return_connection(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_leased_connection_is_not_shared() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 10));

        let leased = pool.get_connection().await.unwrap();
        let channel = pool.get_channel().await.unwrap();
        assert_ne!(channel.connection_id(), leased.id());

        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.available_permits, 0);
    }

    #[tokio::test]
    async fn test_closed_connection_is_disposed_on_return() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 10));

        let lease = pool.get_connection().await.unwrap();
        lease.connection().close().await.unwrap();
        pool.return_connection(lease);
        settle().await;

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available_permits, 2);
        assert_eq!(stats.connections_disposed, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_not_reused() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(1, 10));

        let lease = pool.get_channel().await.unwrap();
        let first = lease.connection_id().to_string();
        pool.return_channel(lease);

        broker.close_all_connections();

        let lease = pool.get_channel().await.unwrap();
        assert_ne!(lease.connection_id(), first);
        assert_eq!(broker.stats().connections_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_idle_connections() {
        let broker = MemoryBroker::new();
        let pool = pool(
            &broker,
            PoolConfig {
                idle_timeout: Duration::from_secs(60),
                ..config(3, 10)
            },
        );

        let a = pool.get_channel().await.unwrap();
        let b = pool.get_connection().await.unwrap();
        pool.return_channel(a);
        pool.return_connection(b);
        assert_eq!(pool.stats().idle, 2);

        let report = pool.run_health_check().await;
        assert_eq!(report, SweepReport { inspected: 2, evicted: 0 });

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = pool.run_health_check().await;
        assert_eq!(report, SweepReport { inspected: 2, evicted: 2 });

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available_permits, 3);
        assert_eq!(stats.health_sweeps, 2);
        assert_eq!(stats.sweep_evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs_on_interval() {
        let broker = MemoryBroker::new();
        let pool = pool(
            &broker,
            PoolConfig {
                enable_health_checks: true,
                health_check_interval: Duration::from_secs(120),
                idle_timeout: Duration::from_secs(60),
                ..config(2, 10)
            },
        );

        drop(pool.get_channel().await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_secs(121)).await;
        settle().await;

        let stats = pool.stats();
        assert_eq!(stats.health_sweeps, 1);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_closed_checked_out_connection() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 2));

        let channel = pool.get_channel().await.unwrap();
        let leased = pool.get_connection().await.unwrap();
        assert_ne!(channel.connection_id(), leased.id());

        leased.connection().close().await.unwrap();
        let report = pool.run_health_check().await;
        assert_eq!(report, SweepReport { inspected: 2, evicted: 1 });

        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.available_permits, 1);

        // Returning the evicted lease does not resurrect it
        pool.return_connection(leased);
        pool.return_channel(channel);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.available_permits + stats.total, 2);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_and_rejects_callers() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool(
            &broker,
            PoolConfig {
                connection_timeout: Duration::from_secs(30),
                ..config(1, 1)
            },
        ));

        let held = pool.get_connection().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_channel().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown().await;
        assert!(pool.is_shut_down());

        assert_eq!(
            waiter.await.unwrap(),
            Err(PoolError::ResourceDisposed("connection pool"))
        );
        assert_eq!(
            pool.get_channel().await.err(),
            Some(PoolError::ResourceDisposed("connection pool"))
        );
        assert!(!held.connection().is_open());
        assert_eq!(broker.stats().open_connections, 0);

        // Returning after shutdown is harmless
        pool.return_connection(held);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_up() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(1, 1));
        let _held = pool.get_connection().await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let result = pool.get_channel_with(&cancel).await;
        assert_eq!(result.err(), Some(PoolError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_with_channel_returns_channel() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 2));

        let id = pool
            .execute_with_channel(|channel| async move { Ok::<_, PoolError>(channel.id()) })
            .await
            .unwrap();
        assert!(id > 0);

        let failed: std::result::Result<(), PoolError> = pool
            .execute_with_channel(|channel| async move {
                Err(PoolError::Broker(BrokerError::ChannelClosed(channel.id())))
            })
            .await;
        assert!(failed.is_err());

        assert_eq!(pool.stats().channels_in_use, 0);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_execute_with_channel_retries_transient_failures() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 2));
        let calls = AtomicUsize::new(0);

        let counter = &calls;
        let value = pool
            .execute_with_channel(move |_channel| async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PoolError::Broker(BrokerError::Io("reset".into())))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_with_channel_does_not_retry_fatal_errors() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(2, 2));
        let calls = AtomicUsize::new(0);

        let counter = &calls;
        let result: std::result::Result<(), PoolError> = pool
            .execute_with_channel(move |_channel| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PoolError::Config("bad routing".into()))
            })
            .await;

        assert_eq!(result, Err(PoolError::Config("bad routing".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_creation_is_retried() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let pool = pool(&broker, config(1, 1));

        let lease = pool.get_channel().await.unwrap();
        assert!(lease.is_open());
        assert_eq!(broker.stats().connect_attempts, 3);
        assert_eq!(pool.stats().connections_created, 1);
    }

    #[tokio::test]
    async fn test_connection_creation_failure_releases_capacity() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);
        let pool = pool(&broker, config(1, 1));

        let result = pool.get_channel().await;
        assert!(matches!(
            result,
            Err(PoolError::Broker(BrokerError::ConnectionRefused(_)))
        ));
        assert_eq!(pool.stats().available_permits, 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_hands_channel_back() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, config(1, 1));

        let lease = pool.get_channel().await.unwrap();
        let channel_id = lease.channel_id();
        assert_eq!(pool.stats().channels_in_use, 1);
        drop(lease);

        assert_eq!(pool.stats().channels_in_use, 0);
        let again = pool.get_channel().await.unwrap();
        assert_eq!(again.channel_id(), channel_id);
        assert_eq!(broker.stats().channels_opened, 1);
    }

    #[tokio::test]
    async fn test_waiter_reclaims_after_sweep_evicts_its_connection() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool(&broker, config(1, 1)));

        let held = pool.get_channel().await.unwrap();
        let first = held.connection_id().to_string();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.get_channel().await?;
                Ok::<_, PoolError>(lease.connection_id().to_string())
            })
        };
        settle().await;

        broker.close_all_connections();
        let report = pool.run_health_check().await;
        assert_eq!(report.evicted, 1);

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second, first);
        assert_eq!(broker.stats().connections_opened, 2);

        drop(held);
        settle().await;
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.available_permits, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_counts_once_against_breaker() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let pipeline = Arc::new(ResiliencePipeline::new(
            BROKER,
            PipelineOptions {
                retry: RetryPolicy::none(),
                circuit_breaker: CircuitBreakerPolicy {
                    minimum_throughput: 2,
                    ..CircuitBreakerPolicy::default()
                },
                timeout: Duration::from_secs(5),
            },
        ));
        let pool = ConnectionPool::new(broker.clone(), config(1, 1), pipeline).unwrap();

        let result = pool
            .execute_with_channel(|channel| async move { Ok::<_, PoolError>(channel.id()) })
            .await;
        assert!(matches!(
            result,
            Err(PoolError::Broker(BrokerError::ConnectionRefused(_)))
        ));
        assert_eq!(broker.stats().connect_attempts, 1);
        assert_eq!(
            pool.pipeline().breaker().state(),
            warren_core_resilience::CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_channel_bounds_hanging_connect() {
        let broker = MemoryBroker::new();
        broker.set_hang_connects(true);
        let pool = pool(
            &broker,
            PoolConfig {
                connection_timeout: Duration::from_secs(60),
                ..config(1, 1)
            },
        );

        let result: std::result::Result<(), PoolError> = pool
            .execute_with_channel(|_channel| async move { Ok(()) })
            .await;

        assert_eq!(result, Err(PoolError::OperationTimeout(Duration::from_secs(5))));
        assert_eq!(broker.stats().connect_attempts, 3);
        assert_eq!(pool.stats().available_permits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_respect_limits() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(pool(&broker, config(3, 2)));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    pool.execute_with_channel(|_channel| async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok::<_, PoolError>(())
                    })
                    .await?;
                }
                Ok::<_, PoolError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = pool.stats();
        assert!(stats.total <= 3);
        assert_eq!(stats.available_permits + stats.total, 3);
        assert_eq!(stats.channels_in_use, 0);
        assert!(broker.stats().max_concurrent_channels <= 6);
        assert!(broker.stats().max_open_connections <= 3);
    }
}
