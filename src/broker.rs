/*!
 * Broker client abstractions
 *
 * The pool only depends on these shapes: a factory that opens physical
 * connections, connections that open channels, and channels that report
 * their id and whether they are still open. Queue primitives live on the
 * separate [`QueueChannel`], [`PublishChannel`] and [`ConsumeChannel`] traits
 * so the pool itself never needs them.
 */

use async_trait::async_trait;
use thiserror::Error;

/// Channel number, unique within one connection
pub type ChannelId = u16;

/// Failures reported by a broker client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection could not be established
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),

    /// Connection was closed by either side
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Channel was closed by either side
    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// Broker rejected the operation
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    /// I/O failure talking to the broker
    #[error("Broker I/O error: {0}")]
    Io(String),
}

/// Opens physical connections to the broker
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new physical connection
    async fn create_connection(&self) -> Result<Self::Connection, BrokerError>;
}

/// One physical, multiplexed connection to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new logical channel on this connection
    async fn create_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A lightweight logical session over a connection
///
/// Implementations are cheap handles: clones refer to the same channel.
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Queue options used when declaring a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Message properties attached to a publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Ask the broker to persist the message
    pub persistent: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Unix timestamp in seconds
    pub timestamp: Option<i64>,
}

/// A message handed out by the broker, awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery
    pub delivery_tag: u64,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// The broker delivered this message before and it was not acknowledged
    pub redelivered: bool,
}

/// Queue management shared by publishers and consumers
#[async_trait]
pub trait QueueChannel: BrokerChannel {
    /// Declare (or assert) a queue
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError>;
}

/// Publishing primitives offered by a channel
#[async_trait]
pub trait PublishChannel: QueueChannel {
    /// Publish a message to `routing_key` on the default exchange
    async fn publish(
        &self,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError>;
}

/// Consuming primitives offered by a channel
///
/// Deliveries must be acknowledged on the channel that received them. Closing
/// a channel puts its unacknowledged deliveries back on their queues.
#[async_trait]
pub trait ConsumeChannel: QueueChannel {
    /// Limit unacknowledged deliveries on this channel; `0` means no limit
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Take the next message from `queue`, `None` when nothing can be delivered
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery, putting it back at the head of its queue when `requeue`
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
