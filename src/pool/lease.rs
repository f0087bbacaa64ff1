//! Checked-out resources that hand themselves back on drop

use super::connection_pool::PoolInner;
use super::pooled_connection::{ChannelCheckout, PooledConnection, Release};
use crate::broker::{BrokerChannel, BrokerConnection, ChannelId, ConnectionFactory};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

pub(crate) type Conn<F> = Arc<PooledConnection<<F as ConnectionFactory>::Connection>>;

/// Channel type produced by a factory's connections
pub type ChannelOf<F> = <<F as ConnectionFactory>::Connection as BrokerConnection>::Channel;

/// A caller's hold on a shared connection
pub(crate) struct ChannelClaim<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    connection: Conn<F>,
}

impl<F: ConnectionFactory> ChannelClaim<F> {
    /// Wrap a claim the caller has already registered on `connection`
    pub(crate) fn new(pool: Arc<PoolInner<F>>, connection: Conn<F>) -> Self {
        Self { pool, connection }
    }

    pub(crate) fn connection(&self) -> &Conn<F> {
        &self.connection
    }
}

impl<F: ConnectionFactory> Drop for ChannelClaim<F> {
    fn drop(&mut self) {
        match self.connection.release_claim() {
            Release::StillClaimed => {}
            Release::Parked => self.pool.check_in(&self.connection),
            Release::Retire => self.pool.retire(&self.connection),
        }
    }
}

/// A channel borrowed from the pool
///
/// Dereferences to the channel handle. Dropping the lease (or passing it to
/// [`ConnectionPool::return_channel`](super::ConnectionPool::return_channel))
/// returns the channel to its connection.
pub struct ChannelLease<F: ConnectionFactory> {
    checkout: Option<ChannelCheckout<ChannelOf<F>>>,
    channel: ChannelOf<F>,
    claim: ChannelClaim<F>,
}

impl<F: ConnectionFactory> ChannelLease<F> {
    pub(crate) fn new(checkout: ChannelCheckout<ChannelOf<F>>, claim: ChannelClaim<F>) -> Self {
        debug_assert_eq!(checkout.connection_id(), claim.connection().id());
        Self {
            channel: checkout.channel().clone(),
            checkout: Some(checkout),
            claim,
        }
    }

    pub fn channel(&self) -> &ChannelOf<F> {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Id of the pooled connection that issued this channel
    pub fn connection_id(&self) -> &str {
        self.claim.connection().id()
    }
}

impl<F: ConnectionFactory> Deref for ChannelLease<F> {
    type Target = ChannelOf<F>;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl<F: ConnectionFactory> Drop for ChannelLease<F> {
    fn drop(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            self.claim.connection().return_channel(checkout);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ChannelLease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("connection_id", &self.connection_id())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

/// A whole connection borrowed from the pool
///
/// While leased the connection is never handed to the channel path.
pub struct ConnectionLease<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    connection: Conn<F>,
}

impl<F: ConnectionFactory> ConnectionLease<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, connection: Conn<F>) -> Self {
        Self { pool, connection }
    }
}

impl<F: ConnectionFactory> Deref for ConnectionLease<F> {
    type Target = PooledConnection<F::Connection>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<F: ConnectionFactory> Drop for ConnectionLease<F> {
    fn drop(&mut self) {
        match self.connection.release_lease() {
            Release::StillClaimed => {}
            Release::Parked => self.pool.check_in(&self.connection),
            Release::Retire => self.pool.retire(&self.connection),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionLease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection_id", &self.connection.id())
            .finish()
    }
}
