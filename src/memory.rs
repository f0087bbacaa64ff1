/*!
 * In-process broker
 *
 * A `ConnectionFactory` that keeps everything in memory. Faults can be
 * injected (refused or hanging connects, random failures, forced closes) and
 * the broker counts what clients did to it, which makes it the backend for
 * tests, benchmarks and the `simulate` command.
 */

use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelId, ConnectionFactory, ConsumeChannel,
    Delivery, MessageProperties, PublishChannel, QueueChannel, QueueOptions,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters describing what clients have done to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBrokerStats {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub open_connections: usize,
    pub max_open_connections: usize,
    pub channels_opened: u64,
    pub open_channels: usize,
    pub max_concurrent_channels: usize,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
    /// Deliveries put back on their queue by a nack or a channel close
    pub messages_requeued: u64,
}

#[derive(Default)]
struct Faults {
    fail_connects: u32,
    fail_publishes: u32,
    hang_connects: bool,
    connect_latency: Duration,
    publish_latency: Duration,
    failure_rate: f64,
}

impl Faults {
    fn random_failure(&self) -> bool {
        self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate.min(1.0))
    }
}

#[derive(Default)]
struct Shared {
    faults: Mutex<Faults>,
    queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    next_connection: AtomicU64,
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    open_connections: AtomicUsize,
    max_open_connections: AtomicUsize,
    channels_opened: AtomicU64,
    open_channels: AtomicUsize,
    max_concurrent_channels: AtomicUsize,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_acked: AtomicU64,
    messages_requeued: AtomicU64,
}

impl Shared {
    /// Put deliveries back at the head of their queues, oldest first
    fn requeue(&self, mut returned: Vec<(String, Delivery)>) {
        if returned.is_empty() {
            return;
        }
        returned.sort_by_key(|(_, delivery)| std::cmp::Reverse(delivery.delivery_tag));
        let count = returned.len() as u64;
        let mut queues = self.queues.lock();
        for (queue, mut delivery) in returned {
            if let Some(queue) = queues.get_mut(&queue) {
                delivery.delivery_tag = 0;
                delivery.redelivered = true;
                queue.push_front(delivery);
            }
        }
        self.messages_requeued.fetch_add(count, Ordering::Relaxed);
    }

    fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
        let open = self.open_channels.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_channels.fetch_max(open, Ordering::AcqRel);
    }

    fn channel_closed(&self) {
        self.open_channels.fetch_sub(1, Ordering::AcqRel);
    }
}

/// In-memory broker; clones share the same state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.faults.lock().fail_connects = n;
    }

    /// Fail the next `n` publishes with an I/O error
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.faults.lock().fail_publishes = n;
    }

    /// Make connection attempts never complete
    pub fn set_hang_connects(&self, hang: bool) {
        self.shared.faults.lock().hang_connects = hang;
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.shared.faults.lock().connect_latency = latency;
    }

    /// Delay every publish by `latency`
    pub fn set_publish_latency(&self, latency: Duration) {
        self.shared.faults.lock().publish_latency = latency;
    }

    /// Probability in `[0, 1]` that a connect or publish fails at random
    pub fn set_failure_rate(&self, rate: f64) {
        self.shared.faults.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Close every open connection, as a broker restart would
    pub fn close_all_connections(&self) {
        let connections: Vec<_> = self.shared.connections.lock().drain(..).collect();
        for connection in connections {
            connection.close(&self.shared);
        }
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        let s = &self.shared;
        MemoryBrokerStats {
            connect_attempts: s.connect_attempts.load(Ordering::Relaxed),
            connections_opened: s.connections_opened.load(Ordering::Relaxed),
            open_connections: s.open_connections.load(Ordering::Acquire),
            max_open_connections: s.max_open_connections.load(Ordering::Acquire),
            channels_opened: s.channels_opened.load(Ordering::Relaxed),
            open_channels: s.open_channels.load(Ordering::Acquire),
            max_concurrent_channels: s.max_concurrent_channels.load(Ordering::Acquire),
            messages_published: s.messages_published.load(Ordering::Relaxed),
            messages_delivered: s.messages_delivered.load(Ordering::Relaxed),
            messages_acked: s.messages_acked.load(Ordering::Relaxed),
            messages_requeued: s.messages_requeued.load(Ordering::Relaxed),
        }
    }

    /// Number of messages waiting in `queue`, `None` if it was never declared
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.shared.queues.lock().get(queue).map(VecDeque::len)
    }

    /// Take the oldest message from `queue`
    pub fn get_message(&self, queue: &str) -> Option<Delivery> {
        self.shared.queues.lock().get_mut(queue)?.pop_front()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    type Connection = MemoryConnection;

    async fn create_connection(&self) -> Result<MemoryConnection, BrokerError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let (hang, latency) = {
            let mut faults = self.shared.faults.lock();
            if faults.fail_connects > 0 {
                faults.fail_connects -= 1;
                return Err(BrokerError::ConnectionRefused("injected connect failure".into()));
            }
            if faults.random_failure() {
                return Err(BrokerError::ConnectionRefused("random connect failure".into()));
            }
            (faults.hang_connects, faults.connect_latency)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = Arc::new(ConnectionState {
            id: self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1,
            open: AtomicBool::new(true),
            next_channel: AtomicU16::new(1),
            channels: Mutex::new(Vec::new()),
        });
        self.shared.connections.lock().push(state.clone());
        self.shared.connections_opened.fetch_add(1, Ordering::Relaxed);
        let open = self.shared.open_connections.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.max_open_connections.fetch_max(open, Ordering::AcqRel);

        Ok(MemoryConnection {
            state,
            shared: self.shared.clone(),
        })
    }
}

struct ConnectionState {
    id: u64,
    open: AtomicBool,
    next_channel: AtomicU16,
    channels: Mutex<Vec<Arc<ChannelState>>>,
}

impl ConnectionState {
    fn close(&self, shared: &Shared) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        shared.open_connections.fetch_sub(1, Ordering::AcqRel);
        for channel in self.channels.lock().drain(..) {
            channel.close(shared);
        }
    }
}

struct ChannelState {
    id: ChannelId,
    open: AtomicBool,
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    /// Delivered but not yet acknowledged, keyed by delivery tag
    unacked: Mutex<HashMap<u64, (String, Delivery)>>,
}

impl ChannelState {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
        }
    }

    fn close(&self, shared: &Shared) {
        if self.open.swap(false, Ordering::AcqRel) {
            shared.channel_closed();
            let returned: Vec<_> = self.unacked.lock().drain().map(|(_, entry)| entry).collect();
            shared.requeue(returned);
        }
    }
}

/// Connection to a [`MemoryBroker`]; clones refer to the same connection
#[derive(Clone)]
pub struct MemoryConnection {
    state: Arc<ConnectionState>,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    /// Broker-assigned connection number
    pub fn id(&self) -> u64 {
        self.state.id
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }
        let channel = Arc::new(ChannelState::new(
            self.state.next_channel.fetch_add(1, Ordering::Relaxed),
        ));
        self.state.channels.lock().push(channel.clone());
        self.shared.channel_opened();

        Ok(MemoryChannel {
            state: channel,
            connection: self.state.clone(),
            shared: self.shared.clone(),
        })
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared
            .connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.state));
        self.state.close(&self.shared);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`]
#[derive(Clone)]
pub struct MemoryChannel {
    state: Arc<ChannelState>,
    connection: Arc<ConnectionState>,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(self.state.id))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.state.id
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire) && self.connection.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .channels
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.state));
        self.state.close(&self.shared);
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, _options: &QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if queue.is_empty() {
            return Err(BrokerError::Protocol("queue name must not be empty".into()));
        }
        self.shared.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }
}

#[async_trait]
impl PublishChannel for MemoryChannel {
    async fn publish(
        &self,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let latency = {
            let mut faults = self.shared.faults.lock();
            if faults.fail_publishes > 0 {
                faults.fail_publishes -= 1;
                return Err(BrokerError::Io("injected publish failure".into()));
            }
            if faults.random_failure() {
                return Err(BrokerError::Io("random publish failure".into()));
            }
            faults.publish_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.ensure_open()?;
        }

        // Unroutable messages are dropped, as on the default exchange
        if let Some(queue) = self.shared.queues.lock().get_mut(routing_key) {
            queue.push_back(Delivery {
                delivery_tag: 0,
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
                redelivered: false,
            });
        }
        self.shared.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ConsumeChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.prefetch.store(prefetch_count, Ordering::Release);
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        let prefetch = usize::from(self.state.prefetch.load(Ordering::Acquire));
        if prefetch > 0 && self.state.unacked.lock().len() >= prefetch {
            return Ok(None);
        }

        let taken = {
            let mut queues = self.shared.queues.lock();
            let Some(messages) = queues.get_mut(queue) else {
                return Err(BrokerError::Protocol(format!("no queue '{queue}'")));
            };
            messages.pop_front()
        };
        let Some(mut delivery) = taken else {
            return Ok(None);
        };
        delivery.delivery_tag = self.state.next_tag.fetch_add(1, Ordering::Relaxed);

        {
            let mut unacked = self.state.unacked.lock();
            if self.is_open() {
                unacked.insert(delivery.delivery_tag, (queue.to_string(), delivery.clone()));
                drop(unacked);
                self.shared.messages_delivered.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(delivery));
            }
        }
        self.shared.requeue(vec![(queue.to_string(), delivery)]);
        Err(BrokerError::ChannelClosed(self.state.id))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.state.unacked.lock().remove(&delivery_tag) {
            Some(_) => {
                self.shared.messages_acked.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(BrokerError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let Some(entry) = self.state.unacked.lock().remove(&delivery_tag) else {
            return Err(BrokerError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        if requeue {
            self.shared.requeue(vec![entry]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_and_channel_lifecycle() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let a = conn.create_channel().await.unwrap();
        let b = conn.create_channel().await.unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        assert_eq!(broker.stats().open_channels, 2);

        a.close().await.unwrap();
        assert!(!a.is_open());
        assert_eq!(broker.stats().open_channels, 1);

        conn.close().await.unwrap();
        assert!(!b.is_open());
        assert_eq!(
            conn.create_channel().await.err(),
            Some(BrokerError::ConnectionClosed)
        );

        let stats = broker.stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.open_channels, 0);
        assert_eq!(stats.max_concurrent_channels, 2);
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.create_connection().await.is_err());
        assert!(broker.create_connection().await.is_err());
        assert!(broker.create_connection().await.is_ok());
        assert_eq!(broker.stats().connect_attempts, 3);
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_publish_routes_to_declared_queue() {
        let broker = MemoryBroker::new();
        let channel = broker
            .create_connection()
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();

        channel.publish("nowhere", &MessageProperties::default(), b"lost").await.unwrap();
        assert_eq!(broker.queue_len("nowhere"), None);

        channel.declare_queue("orders", &QueueOptions::default()).await.unwrap();
        channel.publish("orders", &MessageProperties::default(), b"one").await.unwrap();

        assert_eq!(broker.queue_len("orders"), Some(1));
        let delivery = broker.get_message("orders").unwrap();
        assert_eq!(delivery.body, b"one");
        assert_eq!(broker.stats().messages_published, 2);
    }

    #[tokio::test]
    async fn test_get_ack_and_nack() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let props = MessageProperties::default();

        channel.declare_queue("jobs", &QueueOptions::default()).await.unwrap();
        channel.publish("jobs", &props, b"first").await.unwrap();
        channel.publish("jobs", &props, b"second").await.unwrap();

        let first = channel.get("jobs").await.unwrap().unwrap();
        assert_eq!(first.body, b"first");
        assert!(!first.redelivered);
        channel.ack(first.delivery_tag).await.unwrap();
        assert!(channel.ack(first.delivery_tag).await.is_err());

        let second = channel.get("jobs").await.unwrap().unwrap();
        channel.nack(second.delivery_tag, true).await.unwrap();

        let again = channel.get("jobs").await.unwrap().unwrap();
        assert_eq!(again.body, b"second");
        assert!(again.redelivered);
        channel.nack(again.delivery_tag, false).await.unwrap();

        assert_eq!(channel.get("jobs").await.unwrap(), None);
        assert!(channel.get("missing").await.is_err());

        let stats = broker.stats();
        assert_eq!(stats.messages_delivered, 3);
        assert_eq!(stats.messages_acked, 1);
        assert_eq!(stats.messages_requeued, 1);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = broker
            .create_connection()
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();
        let props = MessageProperties::default();
        channel.declare_queue("jobs", &QueueOptions::default()).await.unwrap();
        channel.publish("jobs", &props, b"a").await.unwrap();
        channel.publish("jobs", &props, b"b").await.unwrap();

        channel.qos(1).await.unwrap();
        let held = channel.get("jobs").await.unwrap().unwrap();
        assert_eq!(channel.get("jobs").await.unwrap(), None);

        channel.ack(held.delivery_tag).await.unwrap();
        assert_eq!(channel.get("jobs").await.unwrap().unwrap().body, b"b");
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.declare_queue("jobs", &QueueOptions::default()).await.unwrap();
        channel.publish("jobs", &MessageProperties::default(), b"work").await.unwrap();

        let delivery = channel.get("jobs").await.unwrap().unwrap();
        assert_eq!(broker.queue_len("jobs"), Some(0));

        channel.close().await.unwrap();
        assert_eq!(broker.queue_len("jobs"), Some(1));
        assert!(channel.ack(delivery.delivery_tag).await.is_err());

        let requeued = broker.get_message("jobs").unwrap();
        assert!(requeued.redelivered);
        assert_eq!(requeued.delivery_tag, 0);
    }

    #[tokio::test]
    async fn test_broker_restart_closes_channels() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        broker.close_all_connections();

        assert!(!conn.is_open());
        assert_eq!(
            channel.publish("q", &MessageProperties::default(), b"x").await,
            Err(BrokerError::ChannelClosed(1))
        );
    }
}
