//! JSON message publishing over pooled channels

use crate::broker::{
    ConnectionFactory, MessageProperties, PublishChannel, QueueChannel, QueueOptions,
};
use crate::error::PoolError;
use crate::pool::{ChannelOf, ConnectionPool};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Failures while publishing a message
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Publishes serialisable messages to named queues
///
/// Each publish declares the target queue, then sends the message as
/// persistent `application/json` with a fresh message id and a timestamp. The
/// whole exchange runs through [`ConnectionPool::execute_with_channel_with`],
/// so it is retried and guarded by the pool's resilience pipeline.
pub struct QueuePublisher<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    queue_options: QueueOptions,
}

impl<F> QueuePublisher<F>
where
    F: ConnectionFactory,
    ChannelOf<F>: PublishChannel,
{
    /// Publisher declaring durable, shared, non-auto-delete queues
    pub fn new(pool: Arc<ConnectionPool<F>>) -> Self {
        Self {
            pool,
            queue_options: QueueOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
        }
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    /// Publish `message` to `queue`, returning the assigned message id
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        message: &T,
        queue: &str,
    ) -> Result<String, PublishError> {
        let body = serde_json::to_vec(message)?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let properties = MessageProperties {
            persistent: true,
            content_type: Some("application/json".to_string()),
            message_id: Some(message_id.clone()),
            timestamp: Some(chrono::Utc::now().timestamp()),
        };

        let options = &self.queue_options;
        let properties_ref = &properties;
        let body_ref = body.as_slice();
        let result = self
            .pool
            .execute_with_channel_with(cancel, move |channel| async move {
                channel.declare_queue(queue, options).await?;
                channel.publish(queue, properties_ref, body_ref).await?;
                Ok::<_, PoolError>(())
            })
            .await;

        match result {
            Ok(()) => {
                debug!(queue, message_id = %message_id, bytes = body.len(), "Published message");
                Ok(message_id)
            }
            Err(e) => {
                error!(queue, error = %e, "Failed to publish message");
                Err(e.into())
            }
        }
    }
}
