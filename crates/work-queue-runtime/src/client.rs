//! Broker boundary traits and connection factory.
//!
//! A [`Connection`] is dialled once per process role and hands out
//! [`Channel`]s. All queue operations (declare, publish, consume, ack/nack)
//! go through a channel; each provider serialises the calls made on one
//! channel internally.

use crate::error::QueueError;
use crate::message::{
    ConsumerSession, ConsumerTag, Delivery, DeliveryTag, QueueDescriptor, QueueName, Task,
};
use crate::provider::{ProviderConfig, ProviderType};
use crate::providers::AmqpConnection;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// A live connection to a broker
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Box<dyn Channel>, QueueError>;

    /// Close the connection; unacknowledged deliveries are returned to their queues
    async fn close(&self) -> Result<(), QueueError>;

    /// Check whether the connection is still usable
    fn is_connected(&self) -> bool;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Interface for queue operations on a single channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Ensure the queue exists with exactly these attributes (idempotent)
    async fn declare_queue(&self, descriptor: &QueueDescriptor) -> Result<(), QueueError>;

    /// Publish a task and wait for the broker to confirm it within `deadline`
    async fn publish(
        &self,
        queue: &QueueName,
        task: &Task,
        deadline: Duration,
    ) -> Result<(), QueueError>;

    /// Register a consumer; deliveries arrive on the returned stream
    async fn consume(
        &self,
        queue: &QueueName,
        session: &ConsumerSession,
    ) -> Result<DeliveryStream, QueueError>;

    /// Mark a delivery as successfully processed
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Mark a delivery as failed, optionally returning it to the queue
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;

    /// Close the channel; unacknowledged deliveries are returned to their queues
    async fn close(&self) -> Result<(), QueueError>;
}

// ============================================================================
// Delivery Stream
// ============================================================================

/// Sending half feeding a [`DeliveryStream`]
pub type DeliverySender = mpsc::Sender<Result<Delivery, QueueError>>;

/// Lazy, infinite sequence of deliveries for one consumer.
///
/// Backed by a bounded channel filled by a background task. Once it yields
/// `None` the consumer is gone and the stream cannot be restarted.
pub struct DeliveryStream {
    consumer_tag: ConsumerTag,
    receiver: mpsc::Receiver<Result<Delivery, QueueError>>,
}

impl DeliveryStream {
    /// Create a stream together with the sender a background task feeds
    pub fn channel(consumer_tag: ConsumerTag, capacity: usize) -> (DeliverySender, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            sender,
            Self {
                consumer_tag,
                receiver,
            },
        )
    }

    /// Wait for the next delivery
    pub async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        self.receiver.recv().await
    }

    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }
}

impl std::fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// Run `operation`, failing with [`QueueError::Timeout`] once `deadline` passes
pub async fn with_deadline<T, F>(deadline: Duration, operation: F) -> Result<T, QueueError>
where
    F: Future<Output = Result<T, QueueError>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Timeout { duration: deadline }),
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Factory for dialling brokers with the appropriate provider
pub struct ConnectionFactory;

impl ConnectionFactory {
    /// Dial the broker described by `config`
    pub async fn connect(config: &ProviderConfig) -> Result<Box<dyn Connection>, QueueError> {
        let connection: Box<dyn Connection> = match config {
            ProviderConfig::Amqp(connection_config) => {
                connection_config.validate()?;
                info!(uri = %connection_config.redacted_uri(), "Connecting to AMQP broker");
                Box::new(AmqpConnection::dial(connection_config).await?)
            }
            ProviderConfig::InMemory(broker) => {
                debug!("Connecting to in-memory broker");
                Box::new(broker.connect())
            }
        };

        Ok(connection)
    }
}
