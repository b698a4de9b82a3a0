//! AMQP 0.9.1 provider backed by `lapin`.
//!
//! Channels are opened in publisher-confirm mode so a publish only succeeds
//! once the broker has taken responsibility for the task.

use crate::client::{with_deadline, Channel, Connection, DeliverySender, DeliveryStream};
use crate::config::ConnectionConfig;
use crate::error::QueueError;
use crate::message::{
    ConsumerSession, ConsumerTag, Delivery, DeliveryMode, DeliveryTag, MessageId,
    QueueDescriptor, QueueName, Task, Timestamp,
};
use crate::provider::ProviderType;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

/// Reply code for an orderly close
const REPLY_SUCCESS: u16 = 200;

/// Connection to an AMQP broker
pub struct AmqpConnection {
    inner: lapin::Connection,
}

impl AmqpConnection {
    /// Dial the broker
    pub async fn dial(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let inner = lapin::Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("{}: {}", config.redacted_uri(), e),
            })?;

        info!(host = %config.host, port = config.port, "Connected to AMQP broker");
        Ok(Self { inner })
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, QueueError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| map_lapin_error(e, ""))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, ""))?;

        debug!(channel = channel.id(), "Opened AMQP channel in confirm mode");
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| map_lapin_error(e, ""))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Amqp
    }
}

/// Channel on an AMQP connection
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, descriptor: &QueueDescriptor) -> Result<(), QueueError> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: descriptor.durable,
            exclusive: descriptor.exclusive,
            auto_delete: descriptor.auto_delete,
            nowait: false,
        };

        self.inner
            .queue_declare(descriptor.name.as_str(), options, FieldTable::default())
            .await
            .map_err(|e| match map_lapin_error(e, descriptor.name.as_str()) {
                QueueError::DeclareMismatch {
                    queue_name,
                    existing,
                    ..
                } => QueueError::DeclareMismatch {
                    queue_name,
                    requested: descriptor.attributes(),
                    existing,
                },
                other => other,
            })?;

        debug!(queue = %descriptor.name, attributes = %descriptor.attributes(), "Declared queue");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &QueueName,
        task: &Task,
        deadline: Duration,
    ) -> Result<(), QueueError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(task.delivery_mode.as_amqp())
            .with_content_type(ShortString::from(task.content_type.clone()))
            .with_message_id(ShortString::from(task.message_id.to_string()));

        with_deadline(deadline, async {
            let confirm = self
                .inner
                .basic_publish(
                    "",
                    queue.as_str(),
                    BasicPublishOptions::default(),
                    &task.body,
                    properties,
                )
                .await
                .map_err(|e| map_lapin_error(e, queue.as_str()))?;

            let confirmation = confirm
                .await
                .map_err(|e| map_lapin_error(e, queue.as_str()))?;

            if confirmation.is_nack() {
                return Err(QueueError::ProviderError {
                    provider: ProviderType::Amqp.to_string(),
                    code: "NACK".to_string(),
                    message: format!("broker refused task {}", task.message_id),
                });
            }
            Ok(())
        })
        .await
    }

    async fn consume(
        &self,
        queue: &QueueName,
        session: &ConsumerSession,
    ) -> Result<DeliveryStream, QueueError> {
        if !session.auto_ack {
            self.inner
                .basic_qos(session.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| map_lapin_error(e, queue.as_str()))?;
        }

        let tag = session
            .consumer_tag
            .clone()
            .unwrap_or_else(ConsumerTag::generate);

        let consumer = self
            .inner
            .basic_consume(
                queue.as_str(),
                tag.as_str(),
                BasicConsumeOptions {
                    no_ack: session.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_lapin_error(e, queue.as_str()))?;

        let (sender, stream) = DeliveryStream::channel(tag.clone(), session.buffer_capacity());
        debug!(
            queue = %queue,
            consumer = %tag,
            prefetch = session.prefetch_count,
            "Registered consumer"
        );
        tokio::spawn(pump_deliveries(consumer, queue.clone(), sender));
        Ok(stream)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.inner
            .basic_ack(tag.value(), BasicAckOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, ""))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.inner
            .basic_nack(
                tag.value(),
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| map_lapin_error(e, ""))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| map_lapin_error(e, ""))
    }
}

/// Move deliveries from the `lapin` consumer into the bounded stream
async fn pump_deliveries(mut consumer: lapin::Consumer, queue: QueueName, sender: DeliverySender) {
    loop {
        let item = tokio::select! {
            item = consumer.next() => item,
            _ = sender.closed() => break,
        };

        let forwarded = match item {
            Some(Ok(delivery)) => sender.send(Ok(convert_delivery(delivery, &queue))).await,
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Consumer failed");
                let _ = sender.send(Err(map_lapin_error(e, queue.as_str()))).await;
                break;
            }
            None => {
                warn!(queue = %queue, "Consumer cancelled by broker");
                break;
            }
        };

        if forwarded.is_err() {
            // Unacked deliveries return to the queue when the channel closes
            break;
        }
    }

    debug!(queue = %queue, "Consumer pump stopped");
}

fn convert_delivery(delivery: lapin::message::Delivery, queue: &QueueName) -> Delivery {
    let properties = &delivery.properties;

    Delivery {
        tag: DeliveryTag::new(delivery.delivery_tag),
        queue: queue.clone(),
        message_id: properties
            .message_id()
            .as_ref()
            .and_then(|id| id.as_str().parse::<MessageId>().ok()),
        body: delivery.data.into(),
        delivery_mode: DeliveryMode::from_amqp(*properties.delivery_mode()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        redelivered: delivery.redelivered,
        delivered_at: Timestamp::now(),
    }
}

/// Translate a `lapin` failure into the broker-neutral error type
pub(crate) fn map_lapin_error(error: lapin::Error, queue: &str) -> QueueError {
    match error {
        lapin::Error::ProtocolError(amqp) => {
            let message = amqp.get_message().as_str().to_string();
            match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    QueueError::DeclareMismatch {
                        queue_name: queue.to_string(),
                        requested: String::new(),
                        existing: message,
                    }
                }
                AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => QueueError::QueueLocked {
                    queue_name: queue.to_string(),
                },
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                },
                AMQPErrorKind::Hard(_) => QueueError::ConnectionLost { message },
                kind => QueueError::ProviderError {
                    provider: ProviderType::Amqp.to_string(),
                    code: format!("{:?}", kind),
                    message,
                },
            }
        }
        lapin::Error::IOError(e) => QueueError::ConnectionLost {
            message: e.to_string(),
        },
        lapin::Error::InvalidConnectionState(state) => QueueError::ConnectionLost {
            message: format!("connection is {:?}", state),
        },
        lapin::Error::InvalidChannelState(state) => QueueError::ChannelClosed {
            message: format!("channel is {:?}", state),
        },
        other => QueueError::ProviderError {
            provider: ProviderType::Amqp.to_string(),
            code: "CLIENT".to_string(),
            message: other.to_string(),
        },
    }
}
