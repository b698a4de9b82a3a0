//! Common test utilities for work-queue integration tests
//!
//! This module provides:
//! - A recording task handler with configurable behaviour
//! - Helpers to start and stop workers on an in-memory broker
//! - Polling helpers for broker state

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use work_queue_runtime::{
    Channel, Connection, Delivery, HandlerError, InMemoryBroker, Producer, QueueDescriptor,
    QueueError, QueueName, Shutdown, TaskHandler, Worker, WorkerStats,
};

/// How long helpers wait for the broker before failing a test
pub const WAIT_LIMIT: Duration = Duration::from_secs(30);

// ============================================================================
// Recording Handler
// ============================================================================

/// What a [`RecordingHandler`] does after recording a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Behaviour {
    /// Complete immediately
    Succeed,
    /// Never complete, keeping the delivery unacknowledged
    Hang,
    /// Fail with a retryable error unless the delivery is a redelivery
    FailFirstAttempt,
}

/// Handler that forwards every delivery it sees to the test
pub struct RecordingHandler {
    seen: mpsc::UnboundedSender<Delivery>,
    behaviour: Behaviour,
}

impl RecordingHandler {
    pub fn new(behaviour: Behaviour) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (seen, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { seen, behaviour }), receiver)
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let _ = self.seen.send(delivery.clone());

        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Hang => std::future::pending().await,
            Behaviour::FailFirstAttempt if !delivery.redelivered => Err(HandlerError::Retryable {
                message: "first attempt fails".to_string(),
            }),
            Behaviour::FailFirstAttempt => Ok(()),
        }
    }
}

/// Wait for the next delivery a [`RecordingHandler`] saw
#[allow(dead_code)]
pub async fn next_seen(receiver: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(WAIT_LIMIT, receiver.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler dropped")
}

// ============================================================================
// Broker Helpers
// ============================================================================

pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// Durable, non-exclusive queue as the producer and worker use by default
pub fn durable_queue(name: &str) -> QueueDescriptor {
    QueueDescriptor::durable(queue_name(name))
}

/// Open a connection and one channel on it
pub async fn open_channel(broker: &InMemoryBroker) -> (impl Connection, Arc<dyn Channel>) {
    let connection = broker.connect();
    let channel: Arc<dyn Channel> = Arc::from(connection.open_channel().await.unwrap());
    (connection, channel)
}

/// Publish persistent bodies on a fresh connection that is closed afterwards
#[allow(dead_code)]
pub async fn publish_all(broker: &InMemoryBroker, queue: &QueueDescriptor, bodies: &[&str]) {
    let (connection, channel) = open_channel(broker).await;
    let producer = Producer::new(channel.clone(), Duration::from_secs(5));
    producer
        .publish_batch(queue, bodies.iter().map(|b| b.to_string()), true)
        .await
        .unwrap();
    channel.close().await.unwrap();
    connection.close().await.unwrap();
}

/// Poll `condition` until it holds
#[allow(dead_code)]
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wait until `queue` has no ready or unacknowledged tasks
#[allow(dead_code)]
pub async fn wait_for_drain(broker: &InMemoryBroker, queue: &QueueName) {
    wait_until(|| {
        broker
            .queue_stats(queue)
            .is_some_and(|stats| stats.ready == 0 && stats.unacked == 0)
    })
    .await;
}

// ============================================================================
// Running Workers
// ============================================================================

/// Worker running on its own connection in a background task
pub struct RunningWorker {
    pub connection: Box<dyn Connection>,
    pub channel: Arc<dyn Channel>,
    shutdown: Shutdown,
    handle: JoinHandle<Result<WorkerStats, QueueError>>,
}

impl RunningWorker {
    /// Signal shutdown and wait for the worker's result
    #[allow(dead_code)]
    pub async fn stop(self) -> Result<WorkerStats, QueueError> {
        self.shutdown.trigger();
        let result = self.handle.await.expect("worker task panicked");
        let _ = self.channel.close().await;
        let _ = self.connection.close().await;
        result
    }

    /// Wait for the worker to stop by itself
    #[allow(dead_code)]
    pub async fn join(self) -> Result<WorkerStats, QueueError> {
        tokio::time::timeout(WAIT_LIMIT, self.handle)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked")
    }
}

/// Start a fair-dispatch worker consuming `queue`
pub async fn spawn_worker(
    broker: &InMemoryBroker,
    queue: QueueDescriptor,
    handler: Arc<dyn TaskHandler>,
) -> RunningWorker {
    let connection: Box<dyn Connection> = Box::new(broker.connect());
    let channel: Arc<dyn Channel> = Arc::from(connection.open_channel().await.unwrap());
    let shutdown = Shutdown::new();

    let worker = Worker::new(channel.clone(), queue, handler);
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    RunningWorker {
        connection,
        channel,
        shutdown,
        handle,
    }
}
