//! One physical broker connection and the channels multiplexed over it
//!
//! A [`PooledConnection`] bounds concurrently issued channels with its own
//! semaphore, keeps returned channels for reuse, and tracks how recently it was
//! used so the pool can retire stale connections.

use super::stats::PoolCounters;
use crate::broker::{BrokerChannel, BrokerConnection, ChannelId};
use crate::error::{PoolError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifier of a pooled connection
pub type ConnectionId = String;

/// Where the pool currently keeps a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// In the available queue with no outstanding channels
    Idle,
    /// In the active map, lending channels to any caller
    Shared,
    /// In the active map, checked out whole by one caller
    Leased,
    /// Unhealthy after its last user left; the pool is removing it
    Retiring,
}

/// What the pool must do after a caller lets go of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Other callers still hold claims
    StillClaimed,
    /// Moved to idle; check it into the available queue
    Parked,
    /// No longer healthy; remove and dispose it
    Retire,
}

/// Channel bookkeeping, guarded by one lock
struct Slots<Ch> {
    idle: VecDeque<Ch>,
    active: HashMap<ChannelId, Ch>,
    /// Callers holding or waiting for a channel through the pool
    claims: usize,
    placement: Placement,
}

/// A channel checked out of a [`PooledConnection`]
///
/// Holds one of the connection's channel permits until it is handed back to
/// [`PooledConnection::return_channel`] or dropped.
pub(crate) struct ChannelCheckout<Ch> {
    channel: Ch,
    connection_id: ConnectionId,
    _slot: OwnedSemaphorePermit,
}

impl<Ch: BrokerChannel> ChannelCheckout<Ch> {
    pub fn channel(&self) -> &Ch {
        &self.channel
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Id of the connection the channel was checked out of
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

/// Physical connection plus its bounded channel sub-pool
pub struct PooledConnection<C: BrokerConnection> {
    id: ConnectionId,
    connection: C,
    created_at: Instant,
    last_used: Mutex<Instant>,
    slots: Mutex<Slots<C::Channel>>,
    channel_semaphore: Arc<Semaphore>,
    max_channels: usize,
    idle_timeout: Duration,
    /// Pool capacity permit, released once when the connection is disposed
    capacity: Mutex<Option<OwnedSemaphorePermit>>,
    counters: Arc<PoolCounters>,
    disposed: AtomicBool,
}

impl<C: BrokerConnection> PooledConnection<C> {
    /// Wrap a freshly opened connection
    pub fn new(connection: C, max_channels: usize, idle_timeout: Duration) -> Self {
        let now = Instant::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id,
            connection,
            created_at: now,
            last_used: Mutex::new(now),
            slots: Mutex::new(Slots {
                idle: VecDeque::new(),
                active: HashMap::new(),
                claims: 0,
                placement: Placement::Idle,
            }),
            channel_semaphore: Arc::new(Semaphore::new(max_channels)),
            max_channels,
            idle_timeout,
            capacity: Mutex::new(None),
            counters: Arc::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Attach the pool capacity permit this connection occupies
    pub(crate) fn with_capacity_permit(self, permit: OwnedSemaphorePermit) -> Self {
        *self.capacity.lock() = Some(permit);
        self
    }

    pub(crate) fn with_counters(mut self, counters: Arc<PoolCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying broker connection
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Channels currently checked out
    pub fn active_channel_count(&self) -> usize {
        self.slots.lock().active.len()
    }

    /// Open channels parked for reuse
    pub fn idle_channel_count(&self) -> usize {
        self.slots.lock().idle.len()
    }

    pub fn has_active_channels(&self) -> bool {
        self.active_channel_count() > 0
    }

    /// Channel permits not currently held
    pub fn available_channel_slots(&self) -> usize {
        self.channel_semaphore.available_permits()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Open, not disposed, and used within the staleness bound
    pub fn is_healthy(&self) -> bool {
        !self.is_disposed()
            && self.connection.is_open()
            && self.last_used.lock().elapsed() < self.idle_timeout
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            Err(PoolError::ResourceDisposed("pooled connection"))
        } else {
            Ok(())
        }
    }

    /// Check out a channel, waiting up to `timeout` for a free channel slot
    ///
    /// Reuses an idle channel when one is still open (closed ones are
    /// discarded), otherwise opens a new channel on the connection.
    pub(crate) async fn get_channel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ChannelCheckout<C::Channel>> {
        self.ensure_not_disposed()?;

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = tokio::time::timeout(timeout, self.channel_semaphore.clone().acquire_owned()) => {
                match acquired {
                    Err(_) => return Err(PoolError::channel_timeout(timeout)),
                    Ok(Err(_)) => return Err(PoolError::ResourceDisposed("pooled connection")),
                    Ok(Ok(permit)) => permit,
                }
            }
        };
        self.ensure_not_disposed()?;

        if let Some(channel) = self.reuse_idle_channel() {
            self.touch();
            PoolCounters::bump(&self.counters.channels_reused);
            debug!(connection_id = %self.id, channel_id = channel.id(), "Reused channel");
            return Ok(ChannelCheckout {
                channel,
                connection_id: self.id.clone(),
                _slot: slot,
            });
        }

        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            created = self.connection.create_channel() => created?,
        };

        {
            let mut slots = self.slots.lock();
            if self.is_disposed() {
                drop(slots);
                spawn_close(channel);
                return Err(PoolError::ResourceDisposed("pooled connection"));
            }
            slots.active.insert(channel.id(), channel.clone());
        }

        self.touch();
        PoolCounters::bump(&self.counters.channels_created);
        debug!(connection_id = %self.id, channel_id = channel.id(), "Created channel");
        Ok(ChannelCheckout {
            channel,
            connection_id: self.id.clone(),
            _slot: slot,
        })
    }

    fn reuse_idle_channel(&self) -> Option<C::Channel> {
        let mut slots = self.slots.lock();
        while let Some(channel) = slots.idle.pop_front() {
            if channel.is_open() {
                slots.active.insert(channel.id(), channel.clone());
                return Some(channel);
            }
            PoolCounters::bump(&self.counters.channels_discarded);
            debug!(connection_id = %self.id, channel_id = channel.id(), "Discarded closed idle channel");
        }
        None
    }

    /// Hand a channel back, releasing its slot
    ///
    /// Open channels are parked for reuse; closed ones are discarded. A
    /// channel this connection does not recognise (issued elsewhere, or
    /// drained by disposal) is discarded and closed; `false` is returned.
    pub(crate) fn return_channel(&self, checkout: ChannelCheckout<C::Channel>) -> bool {
        let ChannelCheckout {
            channel,
            connection_id,
            _slot,
        } = checkout;
        let id = channel.id();

        let recognised = connection_id == self.id && {
            let mut slots = self.slots.lock();
            match slots.active.remove(&id) {
                Some(_) if channel.is_open() && !self.is_disposed() => {
                    slots.idle.push_back(channel.clone());
                    true
                }
                Some(_) => {
                    PoolCounters::bump(&self.counters.channels_discarded);
                    debug!(connection_id = %self.id, channel_id = id, "Discarded closed channel on return");
                    true
                }
                None => false,
            }
        };

        if recognised {
            self.touch();
        } else {
            if !self.is_disposed() {
                warn!(
                    connection_id = %self.id,
                    owner = %connection_id,
                    channel_id = id,
                    "Returned channel is not tracked by this connection, discarding"
                );
            }
            PoolCounters::bump(&self.counters.channels_discarded);
            if channel.is_open() {
                spawn_close(channel);
            }
        }
        recognised
    }

    /// Whether `channel_id` is checked out of, or parked on, this connection
    pub fn owns_channel(&self, channel_id: ChannelId) -> bool {
        let slots = self.slots.lock();
        slots.active.contains_key(&channel_id) || slots.idle.iter().any(|c| c.id() == channel_id)
    }

    pub(crate) fn placement(&self) -> Placement {
        self.slots.lock().placement
    }

    pub(crate) fn claims(&self) -> usize {
        self.slots.lock().claims
    }

    /// Move out of the idle queue into `placement`; a shared activation
    /// counts as the activating caller's claim.
    pub(crate) fn activate(&self, placement: Placement) -> bool {
        let mut slots = self.slots.lock();
        if self.is_disposed() || slots.placement != Placement::Idle {
            return false;
        }
        slots.placement = placement;
        slots.claims = usize::from(placement == Placement::Shared);
        drop(slots);
        self.touch();
        true
    }

    /// Register another caller on a shared, healthy connection
    pub(crate) fn try_claim(&self) -> bool {
        let mut slots = self.slots.lock();
        if slots.placement != Placement::Shared || !self.is_healthy() {
            return false;
        }
        slots.claims += 1;
        true
    }

    /// Drop a claim; the last one out parks or retires the connection
    pub(crate) fn release_claim(&self) -> Release {
        let mut slots = self.slots.lock();
        slots.claims = slots.claims.saturating_sub(1);
        if slots.claims > 0 || slots.placement != Placement::Shared {
            return Release::StillClaimed;
        }
        Self::settle(&mut slots, self.is_healthy())
    }

    /// End a whole-connection lease
    pub(crate) fn release_lease(&self) -> Release {
        let mut slots = self.slots.lock();
        if slots.placement != Placement::Leased {
            return Release::StillClaimed;
        }
        Self::settle(&mut slots, self.is_healthy())
    }

    fn settle(slots: &mut Slots<C::Channel>, healthy: bool) -> Release {
        if healthy {
            slots.placement = Placement::Idle;
            Release::Parked
        } else {
            slots.placement = Placement::Retiring;
            Release::Retire
        }
    }

    /// Mark an unhealthy checked-out connection for removal
    ///
    /// Returns `false` for idle, already retiring, or healthy connections.
    /// Outstanding leases keep working against the disposed connection and
    /// fail with [`PoolError::ResourceDisposed`].
    pub(crate) fn retire_if_unhealthy(&self) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.placement, Placement::Idle | Placement::Retiring) || self.is_healthy() {
            return false;
        }
        slots.placement = Placement::Retiring;
        true
    }

    /// Give up the pool capacity permit without waiting for disposal to finish
    pub(crate) fn release_capacity(&self) {
        self.capacity.lock().take();
    }

    /// Close every channel and the connection, then release pool capacity
    ///
    /// Safe to call more than once and concurrently with channel operations;
    /// only the first call does any work. Close errors are logged and dropped.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel_semaphore.close();

        let channels: Vec<C::Channel> = {
            let mut slots = self.slots.lock();
            let mut channels: Vec<C::Channel> = slots.active.drain().map(|(_, c)| c).collect();
            channels.extend(slots.idle.drain(..));
            channels
        };

        for channel in channels {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    debug!(connection_id = %self.id, channel_id = channel.id(), error = %e, "Error closing channel");
                }
            }
        }

        if self.connection.is_open() {
            if let Err(e) = self.connection.close().await {
                warn!(connection_id = %self.id, error = %e, "Error closing connection");
            }
        }

        self.release_capacity();
        PoolCounters::bump(&self.counters.connections_disposed);
        debug!(connection_id = %self.id, "Disposed connection");
    }
}

impl<C: BrokerConnection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("open", &self.connection.is_open())
            .field("disposed", &self.is_disposed())
            .field("max_channels", &self.max_channels)
            .finish_non_exhaustive()
    }
}

/// Best-effort background close for a channel nobody tracks any more
pub(crate) fn spawn_close<Ch: BrokerChannel>(channel: Ch) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = channel.close().await {
                debug!(channel_id = channel.id(), error = %e, "Error closing untracked channel");
            }
        });
    }
}
