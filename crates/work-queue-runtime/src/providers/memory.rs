//! In-memory broker implementation for testing and development.
//!
//! This module provides a broker that honours the same contract as a real
//! AMQP broker for the operations this crate uses:
//! - Queue declaration with attribute checks, exclusive and auto-delete queues
//! - FIFO delivery with per-consumer prefetch limits
//! - Explicit ack/nack with requeue at the head of the queue
//! - Redelivery of unacknowledged tasks when a channel or connection closes
//! - Simulated broker restarts that keep only durable queues and persistent tasks
//!
//! All handles ([`InMemoryBroker`], connections, channels) share one state
//! guarded by a mutex; consumers are fed by a background pump task per
//! consumer that wakes whenever the broker state changes.

use crate::client::{with_deadline, Channel, Connection, DeliverySender, DeliveryStream};
use crate::error::QueueError;
use crate::message::{
    ConsumerSession, ConsumerTag, Delivery, DeliveryMode, DeliveryTag, MessageId,
    QueueDescriptor, QueueName, Task, Timestamp,
};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

type ConnectionId = u64;
type ChannelId = u64;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for the whole broker
#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, InMemoryQueue>,
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    next_id: u64,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Fail unless the channel and its connection are open
    fn ensure_open(&self, channel_id: ChannelId) -> Result<ConnectionId, QueueError> {
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or_else(|| QueueError::ChannelClosed {
                message: format!("channel {} does not exist", channel_id),
            })?;

        if let Some(cause) = &channel.closed {
            return Err(cause.to_error());
        }

        Ok(channel.connection)
    }

    /// Fail when an exclusive queue belongs to another connection
    fn ensure_access(
        &self,
        queue: &InMemoryQueue,
        connection: ConnectionId,
    ) -> Result<(), QueueError> {
        match queue.owner {
            Some(owner) if owner != connection => Err(QueueError::QueueLocked {
                queue_name: queue.descriptor.name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn close_channel(&mut self, channel_id: ChannelId, cause: CloseCause) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.closed.is_some() {
            return;
        }

        channel.closed = Some(cause);
        let connection_id = channel.connection;
        let unacked = std::mem::take(&mut channel.unacked);
        let consumers: Vec<ConsumerState> = channel.consumers.drain().map(|(_, c)| c).collect();

        // Walk backwards so the oldest delivery ends up at the head of its queue
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.requeue(entry.task);
            }
        }

        for consumer in consumers {
            self.detach_consumer(&consumer.queue);
        }

        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.channels.retain(|id| *id != channel_id);
        }
        // Closed channels only need to live until their consumer pumps observe the close
        if let Some(channel) = self.channels.get(&channel_id) {
            if channel.consumers.is_empty() && channel.pumps == 0 {
                self.channels.remove(&channel_id);
            }
        }
    }

    fn close_connection(&mut self, connection_id: ConnectionId, cause: CloseCause) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };

        for channel_id in connection.channels {
            self.close_channel(channel_id, cause.clone());
        }

        self.queues.retain(|name, queue| {
            let owned = queue.owner == Some(connection_id);
            if owned {
                debug!(queue = %name, "Deleting exclusive queue of closed connection");
            }
            !owned
        });
    }

    /// Drop one consumer from a queue, deleting auto-delete queues left without consumers
    fn detach_consumer(&mut self, queue_name: &QueueName) {
        let delete = match self.queues.get_mut(queue_name) {
            Some(queue) => {
                queue.consumer_count = queue.consumer_count.saturating_sub(1);
                queue.descriptor.auto_delete && queue.consumer_count == 0
            }
            None => false,
        };

        if delete {
            debug!(queue = %queue_name, "Deleting auto-delete queue without consumers");
            self.queues.remove(queue_name);
        }
    }
}

/// Internal queue state for a single queue
struct InMemoryQueue {
    descriptor: QueueDescriptor,
    /// Tasks waiting for a consumer (FIFO order)
    ready: VecDeque<StoredTask>,
    consumer_count: usize,
    /// Connection owning an exclusive queue
    owner: Option<ConnectionId>,
}

impl InMemoryQueue {
    fn new(descriptor: QueueDescriptor, connection: ConnectionId) -> Self {
        let owner = descriptor.exclusive.then_some(connection);
        Self {
            descriptor,
            ready: VecDeque::new(),
            consumer_count: 0,
            owner,
        }
    }

    fn requeue(&mut self, mut task: StoredTask) {
        task.redelivered = true;
        self.ready.push_front(task);
    }
}

/// A task stored in a queue with metadata
#[derive(Clone)]
struct StoredTask {
    message_id: MessageId,
    body: Bytes,
    delivery_mode: DeliveryMode,
    content_type: String,
    redelivered: bool,
}

impl StoredTask {
    fn from_task(task: &Task) -> Self {
        Self {
            message_id: task.message_id.clone(),
            body: task.body.clone(),
            delivery_mode: task.delivery_mode,
            content_type: task.content_type.clone(),
            redelivered: false,
        }
    }
}

struct ConnectionState {
    channels: Vec<ChannelId>,
}

/// Why a channel stopped
#[derive(Debug, Clone)]
enum CloseCause {
    /// Closed by its owner
    Client,
    /// Closed by the broker after an error on the channel
    Exception(String),
    /// Underlying connection went away
    ConnectionLost(String),
}

impl CloseCause {
    fn to_error(&self) -> QueueError {
        match self {
            Self::Client => QueueError::ChannelClosed {
                message: "channel closed by client".to_string(),
            },
            Self::Exception(message) => QueueError::ChannelClosed {
                message: message.clone(),
            },
            Self::ConnectionLost(message) => QueueError::ConnectionLost {
                message: message.clone(),
            },
        }
    }

    /// Error delivered to consumer streams, `None` for an orderly close
    fn stream_error(&self) -> Option<QueueError> {
        match self {
            Self::Client => None,
            other => Some(other.to_error()),
        }
    }
}

struct ChannelState {
    connection: ConnectionId,
    next_tag: u64,
    unacked: BTreeMap<DeliveryTag, UnackedDelivery>,
    consumers: HashMap<ConsumerTag, ConsumerState>,
    /// Running consumer pump tasks
    pumps: usize,
    closed: Option<CloseCause>,
}

impl ChannelState {
    fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            next_tag: 0,
            unacked: BTreeMap::new(),
            consumers: HashMap::new(),
            pumps: 0,
            closed: None,
        }
    }
}

/// A delivery awaiting ack or nack
struct UnackedDelivery {
    queue: QueueName,
    consumer: ConsumerTag,
    task: StoredTask,
}

struct ConsumerState {
    queue: QueueName,
    prefetch: u16,
    auto_ack: bool,
    in_flight: usize,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

/// Outcome of trying to hand a task to a consumer
enum Take {
    Delivery(Delivery),
    Idle,
    Cancelled(Option<QueueError>),
}

/// Snapshot of a queue's load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting for a consumer
    pub ready: usize,
    /// Tasks delivered but not yet acknowledged
    pub unacked: usize,
    pub consumers: usize,
}

// ============================================================================
// InMemoryBroker
// ============================================================================

struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
    config: InMemoryConfig,
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                config,
            }),
        }
    }

    /// Open a connection to this broker
    pub fn connect(&self) -> InMemoryConnection {
        let id = {
            let mut state = self.lock();
            let id = state.allocate_id();
            state.connections.insert(
                id,
                ConnectionState {
                    channels: Vec::new(),
                },
            );
            id
        };

        debug!(connection = id, "Opened in-memory connection");
        InMemoryConnection {
            broker: self.clone(),
            id,
        }
    }

    /// Load snapshot of a queue, `None` when it does not exist
    pub fn queue_stats(&self, queue: &QueueName) -> Option<QueueStats> {
        let state = self.lock();
        let entry = state.queues.get(queue)?;
        let unacked = state
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|delivery| &delivery.queue == queue)
            .count();

        Some(QueueStats {
            ready: entry.ready.len(),
            unacked,
            consumers: entry.consumer_count,
        })
    }

    /// Check whether a queue currently exists
    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drop every connection as if the network failed
    pub fn disconnect_all(&self) {
        {
            let mut state = self.lock();
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            for id in ids {
                state.close_connection(
                    id,
                    CloseCause::ConnectionLost("connection reset by broker".to_string()),
                );
            }
        }
        warn!("In-memory broker dropped all connections");
        self.inner.changed.notify_waiters();
    }

    /// Simulate a broker restart.
    ///
    /// All connections are dropped, transient queues vanish and durable queues
    /// keep only their persistent tasks.
    pub fn restart(&self) {
        {
            let mut state = self.lock();
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            for id in ids {
                state.close_connection(
                    id,
                    CloseCause::ConnectionLost("broker restarted".to_string()),
                );
            }

            state.queues.retain(|_, queue| queue.descriptor.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|task| task.delivery_mode.is_persistent());
                queue.consumer_count = 0;
            }
        }
        info!("In-memory broker restarted");
        self.inner.changed.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the state consistent enough for tests
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.inner.changed.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------------

    fn open_channel(&self, connection_id: ConnectionId) -> Result<ChannelId, QueueError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&connection_id) {
            return Err(QueueError::ConnectionLost {
                message: format!("connection {} is closed", connection_id),
            });
        }

        let id = state.allocate_id();
        state.channels.insert(id, ChannelState::new(connection_id));
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.channels.push(id);
        }
        Ok(id)
    }

    fn declare_queue(
        &self,
        channel_id: ChannelId,
        descriptor: &QueueDescriptor,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let connection = state.ensure_open(channel_id)?;

        if !state.queues.contains_key(&descriptor.name) {
            state.queues.insert(
                descriptor.name.clone(),
                InMemoryQueue::new(descriptor.clone(), connection),
            );
            info!(
                queue = %descriptor.name,
                attributes = %descriptor.attributes(),
                "Declared queue"
            );
            return Ok(());
        }

        let failure = state.queues.get(&descriptor.name).and_then(|existing| {
            if let Err(e) = state.ensure_access(existing, connection) {
                Some(e)
            } else if !existing.descriptor.matches(descriptor) {
                Some(QueueError::declare_mismatch(descriptor, &existing.descriptor))
            } else {
                None
            }
        });

        match failure {
            None => Ok(()),
            Some(error) => {
                // A failed declare is a channel-level exception
                state.close_channel(channel_id, CloseCause::Exception(error.to_string()));
                drop(state);
                self.notify();
                Err(error)
            }
        }
    }

    fn enqueue(
        &self,
        channel_id: ChannelId,
        queue: &QueueName,
        task: &Task,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let connection = state.ensure_open(channel_id)?;
            let entry = state
                .queues
                .get(queue)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;
            state.ensure_access(entry, connection)?;

            let max_length = self.inner.config.max_queue_length;
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;
            if let Some(max_length) = max_length {
                if entry.ready.len() >= max_length {
                    return Err(QueueError::QueueFull {
                        queue_name: queue.to_string(),
                        max_length,
                    });
                }
            }

            entry.ready.push_back(StoredTask::from_task(task));
        }

        self.notify();
        Ok(())
    }

    fn register_consumer(
        &self,
        channel_id: ChannelId,
        queue: &QueueName,
        session: &ConsumerSession,
    ) -> Result<ConsumerTag, QueueError> {
        let mut state = self.lock();
        let connection = state.ensure_open(channel_id)?;
        let entry = state
            .queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            })?;
        state.ensure_access(entry, connection)?;

        let tag = session
            .consumer_tag
            .clone()
            .unwrap_or_else(ConsumerTag::generate);

        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| QueueError::ChannelClosed {
                message: format!("channel {} does not exist", channel_id),
            })?;
        if channel.consumers.contains_key(&tag) {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.to_string(),
                code: "NOT_ALLOWED".to_string(),
                message: format!("consumer tag '{}' already in use", tag),
            });
        }
        channel.consumers.insert(
            tag.clone(),
            ConsumerState {
                queue: queue.clone(),
                prefetch: session.prefetch_count,
                auto_ack: session.auto_ack,
                in_flight: 0,
            },
        );
        channel.pumps += 1;

        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumer_count += 1;
        }

        Ok(tag)
    }

    fn take_next(&self, channel_id: ChannelId, tag: &ConsumerTag) -> Take {
        let mut state = self.lock();
        let BrokerState {
            queues, channels, ..
        } = &mut *state;

        let Some(channel) = channels.get_mut(&channel_id) else {
            return Take::Cancelled(None);
        };
        if let Some(cause) = &channel.closed {
            return Take::Cancelled(cause.stream_error());
        }
        let Some(consumer) = channel.consumers.get_mut(tag) else {
            return Take::Cancelled(None);
        };
        if !consumer.has_capacity() {
            return Take::Idle;
        }
        let Some(queue) = queues.get_mut(&consumer.queue) else {
            // Queue deleted underneath the consumer
            return Take::Cancelled(None);
        };
        let Some(task) = queue.ready.pop_front() else {
            return Take::Idle;
        };

        channel.next_tag += 1;
        let delivery_tag = DeliveryTag::new(channel.next_tag);
        let delivery = Delivery {
            tag: delivery_tag,
            queue: consumer.queue.clone(),
            message_id: Some(task.message_id.clone()),
            body: task.body.clone(),
            delivery_mode: task.delivery_mode,
            content_type: Some(task.content_type.clone()),
            redelivered: task.redelivered,
            delivered_at: Timestamp::now(),
        };

        if !consumer.auto_ack {
            consumer.in_flight += 1;
            channel.unacked.insert(
                delivery_tag,
                UnackedDelivery {
                    queue: consumer.queue.clone(),
                    consumer: tag.clone(),
                    task,
                },
            );
        }

        Take::Delivery(delivery)
    }

    /// Resolve an outstanding delivery; `requeue` is `None` for an ack
    fn settle(
        &self,
        channel_id: ChannelId,
        tag: DeliveryTag,
        requeue: Option<bool>,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.ensure_open(channel_id)?;

            let channel = state
                .channels
                .get_mut(&channel_id)
                .ok_or_else(|| QueueError::ChannelClosed {
                    message: format!("channel {} does not exist", channel_id),
                })?;
            let entry = channel
                .unacked
                .remove(&tag)
                .ok_or(QueueError::UnknownDeliveryTag { tag })?;
            if let Some(consumer) = channel.consumers.get_mut(&entry.consumer) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }

            match requeue {
                None => {}
                Some(true) => match state.queues.get_mut(&entry.queue) {
                    Some(queue) => queue.requeue(entry.task),
                    None => debug!(queue = %entry.queue, "Queue gone, dropping requeued task"),
                },
                Some(false) => {
                    debug!(queue = %entry.queue, tag = %tag, "Discarding rejected task")
                }
            }
        }

        self.notify();
        Ok(())
    }

    /// Stop a consumer whose stream was dropped
    fn cancel_consumer(&self, channel_id: ChannelId, tag: &ConsumerTag) {
        {
            let mut state = self.lock();
            let removed = state
                .channels
                .get_mut(&channel_id)
                .and_then(|channel| channel.consumers.remove(tag));
            if let Some(consumer) = removed {
                state.detach_consumer(&consumer.queue);
            }
        }
        self.notify();
    }

    /// Hand back a delivery that never reached its consumer
    fn return_undelivered(&self, channel_id: ChannelId, delivery: Delivery) {
        let returned = {
            let mut state = self.lock();
            let BrokerState {
                queues, channels, ..
            } = &mut *state;

            let pending = channels
                .get_mut(&channel_id)
                .and_then(|channel| channel.unacked.remove(&delivery.tag));
            match pending {
                Some(entry) => queues.get_mut(&entry.queue).map(|q| q.requeue(entry.task)),
                // Auto-ack deliveries are not tracked; put the task back as it was
                None => queues.get_mut(&delivery.queue).map(|q| {
                    q.ready.push_front(StoredTask {
                        message_id: delivery.message_id.clone().unwrap_or_default(),
                        body: delivery.body.clone(),
                        delivery_mode: delivery.delivery_mode,
                        content_type: delivery.content_type.clone().unwrap_or_default(),
                        redelivered: delivery.redelivered,
                    })
                }),
            }
        };

        if returned.is_none() {
            debug!(queue = %delivery.queue, "Queue gone, dropping undelivered task");
        }
        self.notify();
    }

    fn pump_finished(&self, channel_id: ChannelId) {
        let mut state = self.lock();
        let remove = match state.channels.get_mut(&channel_id) {
            Some(channel) => {
                channel.pumps = channel.pumps.saturating_sub(1);
                channel.closed.is_some() && channel.pumps == 0
            }
            None => false,
        };
        if remove {
            state.channels.remove(&channel_id);
        }
    }

    fn close_channel(&self, channel_id: ChannelId) {
        self.lock().close_channel(channel_id, CloseCause::Client);
        self.notify();
    }

    fn close_connection(&self, connection_id: ConnectionId, cause: CloseCause) {
        self.lock().close_connection(connection_id, cause);
        self.notify();
    }

    fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&connection_id)
    }

    /// Feed one consumer's stream until the consumer or its channel goes away
    async fn run_consumer(self, channel_id: ChannelId, tag: ConsumerTag, sender: DeliverySender) {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.take_next(channel_id, &tag) {
                Take::Delivery(delivery) => {
                    if let Err(unsent) = sender.send(Ok(delivery)).await {
                        if let Ok(delivery) = unsent.0 {
                            self.return_undelivered(channel_id, delivery);
                        }
                        self.cancel_consumer(channel_id, &tag);
                        break;
                    }
                    continue;
                }
                Take::Idle => {}
                Take::Cancelled(error) => {
                    if let Some(error) = error {
                        let _ = sender.send(Err(error)).await;
                    }
                    break;
                }
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = sender.closed() => {
                    self.cancel_consumer(channel_id, &tag);
                    break;
                }
            }
        }

        debug!(consumer = %tag, "Consumer pump stopped");
        self.pump_finished(channel_id);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("config", &self.inner.config)
            .finish()
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

/// Connection to an [`InMemoryBroker`]; dropping it behaves like a lost TCP connection
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: ConnectionId,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, QueueError> {
        let id = self.broker.open_channel(self.id)?;
        Ok(Box::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.broker.close_connection(self.id, CloseCause::Client);
        debug!(connection = self.id, "Closed in-memory connection");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connected(self.id)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.broker.close_connection(
            self.id,
            CloseCause::ConnectionLost("connection dropped".to_string()),
        );
    }
}

// ============================================================================
// InMemoryChannel
// ============================================================================

/// Channel on an [`InMemoryBroker`] connection
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: ChannelId,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, descriptor: &QueueDescriptor) -> Result<(), QueueError> {
        self.broker.declare_queue(self.id, descriptor)
    }

    async fn publish(
        &self,
        queue: &QueueName,
        task: &Task,
        deadline: Duration,
    ) -> Result<(), QueueError> {
        let confirm_delay = self.broker.inner.config.confirm_delay;
        with_deadline(deadline, async {
            // The task is only stored once confirmed, so a missed deadline publishes nothing
            if let Some(delay) = confirm_delay {
                tokio::time::sleep(delay).await;
            }
            self.broker.enqueue(self.id, queue, task)
        })
        .await
    }

    async fn consume(
        &self,
        queue: &QueueName,
        session: &ConsumerSession,
    ) -> Result<DeliveryStream, QueueError> {
        let tag = self.broker.register_consumer(self.id, queue, session)?;
        let (sender, stream) = DeliveryStream::channel(tag.clone(), session.buffer_capacity());

        debug!(
            queue = %queue,
            consumer = %tag,
            prefetch = session.prefetch_count,
            "Registered consumer"
        );
        tokio::spawn(self.broker.clone().run_consumer(self.id, tag, sender));
        Ok(stream)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.broker.settle(self.id, tag, None)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.broker.settle(self.id, tag, Some(requeue))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.broker.close_channel(self.id);
    }
}
