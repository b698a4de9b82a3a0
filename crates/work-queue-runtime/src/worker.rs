//! Consuming side of the work queue.
//!
//! A [`Worker`] declares its queue, registers a consumer and hands each
//! delivery to a [`TaskHandler`]. The outcome decides how the delivery is
//! settled:
//!
//! | Handler result             | Manual ack session        |
//! |----------------------------|---------------------------|
//! | `Ok(())`                   | ack                       |
//! | `HandlerError::Retryable`  | nack, requeue             |
//! | `HandlerError::Rejected`   | nack, discard             |
//!
//! Auto-ack sessions never settle deliveries; handler failures are only logged.

use crate::client::Channel;
use crate::error::QueueError;
use crate::message::{ConsumerSession, Delivery, QueueDescriptor};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Default simulated work per marker
pub const DEFAULT_UNIT: Duration = Duration::from_secs(1);

/// Default marker byte
pub const DEFAULT_MARKER: u8 = b'.';

/// Failure of a single task
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Task may succeed later; it is returned to the queue
    #[error("Task failed, will be retried: {message}")]
    Retryable { message: String },

    /// Task can never succeed; it is dropped
    #[error("Task rejected: {message}")]
    Rejected { message: String },
}

/// Processes one delivery at a time
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

// ============================================================================
// Handlers
// ============================================================================

/// Simulates work lasting one `unit` per marker byte in the body
#[derive(Debug, Clone)]
pub struct MarkerCostHandler {
    marker: u8,
    unit: Duration,
}

impl MarkerCostHandler {
    pub fn new(marker: u8, unit: Duration) -> Self {
        Self { marker, unit }
    }

    /// Simulated duration of a delivery
    pub fn cost(&self, delivery: &Delivery) -> Duration {
        let markers = u32::try_from(delivery.count_markers(self.marker)).unwrap_or(u32::MAX);
        self.unit.saturating_mul(markers)
    }
}

impl Default for MarkerCostHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER, DEFAULT_UNIT)
    }
}

#[async_trait]
impl TaskHandler for MarkerCostHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        info!("Received a message: {}", delivery.body_text());
        let cost = self.cost(delivery);
        debug!(tag = %delivery.tag, cost_ms = cost.as_millis() as u64, "Simulating work");
        tokio::time::sleep(cost).await;
        info!("Done");
        Ok(())
    }
}

/// Logs each delivery and does nothing else
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        info!("Received a message: {}", delivery.body_text());
        Ok(())
    }
}

/// Handler built from an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Counts of what a worker did with its deliveries.
///
/// In auto-ack sessions successful tasks count as acked and failed ones as
/// rejected, since the broker already forgot them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

/// Long-running consumer of one queue
pub struct Worker {
    name: String,
    channel: Arc<dyn Channel>,
    queue: QueueDescriptor,
    session: ConsumerSession,
    handler: Arc<dyn TaskHandler>,
}

impl Worker {
    /// Worker with fair dispatch (prefetch 1, manual ack)
    pub fn new(
        channel: Arc<dyn Channel>,
        queue: QueueDescriptor,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            name: "worker".to_string(),
            channel,
            queue,
            session: ConsumerSession::fair_dispatch(),
            handler,
        }
    }

    pub fn with_session(mut self, session: ConsumerSession) -> Self {
        self.session = session;
        self
    }

    /// Name used in log output
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `shutdown` fires or the connection is lost.
    ///
    /// A delivery still being handled when `shutdown` fires is left
    /// unacknowledged; the broker redelivers it once the channel closes.
    #[instrument(skip(self, shutdown), fields(worker = %self.name, queue = %self.queue.name))]
    pub async fn run(&self, shutdown: Shutdown) -> Result<WorkerStats, QueueError> {
        self.channel.declare_queue(&self.queue).await?;
        let mut deliveries = self.channel.consume(&self.queue.name, &self.session).await?;

        info!(
            prefetch = self.session.prefetch_count,
            auto_ack = self.session.auto_ack,
            " [*] Waiting for messages. To exit press CTRL+C"
        );

        let mut stats = WorkerStats::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    return Err(e);
                }
                None => {
                    error!("Delivery stream ended");
                    return Err(QueueError::ConnectionLost {
                        message: format!("consumer {} was cancelled", deliveries.consumer_tag()),
                    });
                }
            };
            stats.received += 1;

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!(
                        tag = %delivery.tag,
                        "Shutdown during processing, leaving task unacknowledged"
                    );
                    break;
                }
                outcome = self.handler.handle(&delivery) => outcome,
            };

            self.settle(&delivery, outcome, &mut stats).await?;
        }

        info!(
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            rejected = stats.rejected,
            "Worker stopped"
        );
        Ok(stats)
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: Result<(), HandlerError>,
        stats: &mut WorkerStats,
    ) -> Result<(), QueueError> {
        if self.session.auto_ack {
            match outcome {
                Ok(()) => stats.acked += 1,
                Err(e) => {
                    warn!(
                        tag = %delivery.tag,
                        error = %e,
                        "Task failed after automatic acknowledgement"
                    );
                    stats.rejected += 1;
                }
            }
            return Ok(());
        }

        let result = match &outcome {
            Ok(()) => self.channel.ack(delivery.tag).await,
            Err(HandlerError::Retryable { .. }) => self.channel.nack(delivery.tag, true).await,
            Err(HandlerError::Rejected { .. }) => self.channel.nack(delivery.tag, false).await,
        };

        if let Err(e) = result {
            if e.is_fatal() {
                error!(tag = %delivery.tag, error = %e, "Failed to settle delivery");
                return Err(e);
            }
            warn!(tag = %delivery.tag, error = %e, "Failed to settle delivery");
            return Ok(());
        }

        match outcome {
            Ok(()) => {
                debug!(tag = %delivery.tag, "Acknowledged");
                stats.acked += 1;
            }
            Err(e @ HandlerError::Retryable { .. }) => {
                warn!(tag = %delivery.tag, error = %e, "Requeued task");
                stats.requeued += 1;
            }
            Err(e @ HandlerError::Rejected { .. }) => {
                warn!(tag = %delivery.tag, error = %e, "Discarded task");
                stats.rejected += 1;
            }
        }
        Ok(())
    }
}
