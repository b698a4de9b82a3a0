//! Publishing side of the work queue.

use crate::client::Channel;
use crate::error::QueueError;
use crate::message::{DeliveryMode, MessageId, QueueDescriptor, Task};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Default deadline for a publish to be confirmed
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Character appended to synthetic bodies, one per unit of work
pub const SYNTHETIC_MARKER: char = '.';

/// Publishes tasks to a queue over one channel
pub struct Producer {
    channel: Arc<dyn Channel>,
    publish_timeout: Duration,
}

impl Producer {
    pub fn new(channel: Arc<dyn Channel>, publish_timeout: Duration) -> Self {
        Self {
            channel,
            publish_timeout,
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Declare `queue` and publish one task to it.
    ///
    /// The task is persistent when `durable` is set. On error no task was
    /// enqueued.
    #[instrument(skip(self, body), fields(queue = %queue.name))]
    pub async fn publish(
        &self,
        queue: &QueueDescriptor,
        body: impl Into<Bytes>,
        durable: bool,
    ) -> Result<MessageId, QueueError> {
        self.channel.declare_queue(queue).await?;

        let task = Task::new(body.into(), DeliveryMode::from_durable(durable));
        self.channel
            .publish(&queue.name, &task, self.publish_timeout)
            .await?;

        debug!(message_id = %task.message_id, persistent = durable, "Publish confirmed");
        info!(" [x] Sent {}", String::from_utf8_lossy(&task.body));
        Ok(task.message_id)
    }

    /// Publish several bodies in order, stopping at the first failure
    pub async fn publish_batch<I, B>(
        &self,
        queue: &QueueDescriptor,
        bodies: I,
        durable: bool,
    ) -> Result<Vec<MessageId>, QueueError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut published = Vec::new();
        for body in bodies {
            let id = self.publish(queue, body, durable).await?;
            published.push(id);
        }
        Ok(published)
    }
}

/// Body of the `index`-th generated task, costing `markers` units of work
pub fn synthetic_body(index: usize, markers: usize) -> String {
    let dots: String = std::iter::repeat(SYNTHETIC_MARKER).take(markers).collect();
    format!("Message N°{}{}", index, dots)
}

/// Join command line words into a body; `None` when there is nothing to send
pub fn body_from_args(args: &[String]) -> Option<String> {
    let body = args.join(" ");
    if body.trim().is_empty() {
        None
    } else {
        Some(body)
    }
}
