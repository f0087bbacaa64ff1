//! JSON message consumption over pooled channels

use crate::broker::{ConnectionFactory, ConsumeChannel, QueueChannel, QueueOptions};
use crate::error::PoolError;
use crate::pool::{ChannelOf, ConnectionPool};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling behaviour of a [`QueueConsumer`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Unacknowledged deliveries allowed per channel
    pub prefetch_count: u16,

    /// Pause after finding the queue empty
    pub poll_interval: Duration,

    /// Pause after a failed poll before trying again
    pub error_backoff: Duration,

    pub queue_options: QueueOptions,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(4),
            queue_options: QueueOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
        }
    }
}

/// What happened to the delivery taken by one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    /// Queue was empty
    Empty,

    /// Handler succeeded and the delivery was acknowledged
    Acked { message_id: Option<String> },

    /// Handler failed; the delivery went back on the queue
    Requeued,

    /// Body was not valid for the message type and was dropped
    Rejected,
}

/// Totals of a consumer loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// Pulls JSON messages from a queue and hands them to a handler
///
/// Every poll borrows a channel through
/// [`ConnectionPool::execute_with_channel_with`], so it shares the pool's
/// retry and circuit-breaker protection with publishers. Deliveries are
/// acknowledged only after the handler succeeds; a failing handler gets the
/// message requeued for another attempt.
pub struct QueueConsumer<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    settings: ConsumerSettings,
}

impl<F> QueueConsumer<F>
where
    F: ConnectionFactory,
    ChannelOf<F>: ConsumeChannel,
{
    pub fn new(pool: Arc<ConnectionPool<F>>) -> Self {
        Self::with_settings(pool, ConsumerSettings::default())
    }

    pub fn with_settings(pool: Arc<ConnectionPool<F>>, settings: ConsumerSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Take at most one message from `queue` and process it
    pub async fn consume_one<T, H, Fut, E>(
        &self,
        cancel: &CancellationToken,
        queue: &str,
        handler: &H,
    ) -> Result<Consumed, PoolError>
    where
        T: DeserializeOwned,
        H: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let settings = &self.settings;
        self.pool
            .execute_with_channel_with(cancel, move |channel| async move {
                poll_once(&channel, queue, settings, handler).await
            })
            .await
    }

    /// Poll `queue` until `cancel` fires or the pool fails fatally
    pub async fn run<T, H, Fut, E>(
        &self,
        cancel: &CancellationToken,
        queue: &str,
        handler: H,
    ) -> Result<ConsumerReport, PoolError>
    where
        T: DeserializeOwned,
        H: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        info!(queue, prefetch = self.settings.prefetch_count, "Consumer started");
        let mut report = ConsumerReport::default();

        while !cancel.is_cancelled() {
            let pause = match self.consume_one(cancel, queue, &handler).await {
                Ok(Consumed::Empty) => Some(self.settings.poll_interval),
                Ok(Consumed::Acked { .. }) => {
                    report.acked += 1;
                    None
                }
                Ok(Consumed::Requeued) => {
                    report.requeued += 1;
                    Some(self.settings.error_backoff)
                }
                Ok(Consumed::Rejected) => {
                    report.rejected += 1;
                    None
                }
                Err(PoolError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!(queue, error = %e, "Consumer stopping");
                    return Err(e);
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(queue, error = %e, "Consumer poll failed");
                    Some(self.settings.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(queue, acked = report.acked, requeued = report.requeued, "Consumer stopped");
        Ok(report)
    }
}

/// Declare `queue`, take one delivery from it and settle it
async fn poll_once<C, T, H, Fut, E>(
    channel: &C,
    queue: &str,
    settings: &ConsumerSettings,
    handler: &H,
) -> Result<Consumed, PoolError>
where
    C: ConsumeChannel,
    T: DeserializeOwned,
    H: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    channel.declare_queue(queue, &settings.queue_options).await?;
    channel.qos(settings.prefetch_count).await?;

    let Some(delivery) = channel.get(queue).await? else {
        return Ok(Consumed::Empty);
    };

    let message: T = match serde_json::from_slice(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(queue, delivery_tag = delivery.delivery_tag, error = %e, "Rejecting malformed message");
            channel.nack(delivery.delivery_tag, false).await?;
            return Ok(Consumed::Rejected);
        }
    };

    match handler(message).await {
        Ok(()) => {
            channel.ack(delivery.delivery_tag).await?;
            debug!(queue, delivery_tag = delivery.delivery_tag, "Message processed");
            Ok(Consumed::Acked {
                message_id: delivery.properties.message_id,
            })
        }
        Err(e) => {
            error!(
                queue,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                error = %e,
                "Message handler failed, requeueing"
            );
            channel.nack(delivery.delivery_tag, true).await?;
            Ok(Consumed::Requeued)
        }
    }
}
