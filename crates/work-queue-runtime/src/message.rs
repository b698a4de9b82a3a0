//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Content type attached to every task published by this crate.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // AMQP short strings are limited to 255 bytes
        if name.is_empty() || name.len() > 255 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-255 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, '-', '_', '.' and ':' allowed".to_string(),
            });
        }

        if name.starts_with("amq.") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "the 'amq.' prefix is reserved by the broker".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Unique identifier stamped on every published task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Channel-scoped identifier of a delivery, used to acknowledge it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a consumer registration on a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Generate a broker-style consumer tag
    pub fn generate() -> Self {
        Self(format!("ctag-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Queue Declaration
// ============================================================================

/// Attributes a queue is declared with.
///
/// Every producer and consumer referring to the same logical queue must declare
/// it with identical attributes; the broker rejects a mismatching declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: QueueName,
    /// Queue survives a broker restart
    pub durable: bool,
    /// Queue is deleted once its last consumer goes away
    pub auto_delete: bool,
    /// Queue belongs to the declaring connection only
    pub exclusive: bool,
}

impl QueueDescriptor {
    /// Durable, shared, long-lived queue used for work distribution
    pub fn durable(name: QueueName) -> Self {
        Self {
            name,
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }

    /// Non-durable queue that is lost on broker restart
    pub fn transient(name: QueueName) -> Self {
        Self {
            name,
            durable: false,
            auto_delete: false,
            exclusive: false,
        }
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// True when both descriptors carry the same attributes
    pub fn matches(&self, other: &QueueDescriptor) -> bool {
        self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.exclusive == other.exclusive
    }

    /// Render the attribute set for diagnostics
    pub fn attributes(&self) -> String {
        format!(
            "durable={}, auto_delete={}, exclusive={}",
            self.durable, self.auto_delete, self.exclusive
        )
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Whether a task survives a broker restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn from_durable(durable: bool) -> Self {
        if durable {
            Self::Persistent
        } else {
            Self::Transient
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent)
    }

    /// AMQP `delivery-mode` property value
    pub fn as_amqp(&self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }

    pub fn from_amqp(value: Option<u8>) -> Self {
        match value {
            Some(2) => Self::Persistent,
            _ => Self::Transient,
        }
    }
}

/// A unit of work published to a queue
#[derive(Debug, Clone)]
pub struct Task {
    pub message_id: MessageId,
    pub body: Bytes,
    pub delivery_mode: DeliveryMode,
    pub content_type: String,
}

impl Task {
    /// Create new task with body
    pub fn new(body: Bytes, delivery_mode: DeliveryMode) -> Self {
        Self {
            message_id: MessageId::new(),
            body,
            delivery_mode,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    /// Task that survives a broker restart
    pub fn persistent(body: impl Into<Bytes>) -> Self {
        Self::new(body.into(), DeliveryMode::Persistent)
    }

    pub fn transient(body: impl Into<Bytes>) -> Self {
        Self::new(body.into(), DeliveryMode::Transient)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// A task handed to a consumer, awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: QueueName,
    pub message_id: Option<MessageId>,
    pub body: Bytes,
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
    /// Set when the broker delivered this task before and it was not acknowledged
    pub redelivered: bool,
    pub delivered_at: Timestamp,
}

impl Delivery {
    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Number of occurrences of `marker` in the body
    pub fn count_markers(&self, marker: u8) -> usize {
        self.body.iter().filter(|b| **b == marker).count()
    }
}

// ============================================================================
// Consumer Options
// ============================================================================

/// Options a consumer registers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSession {
    /// Maximum unacknowledged deliveries held at once, 0 = unlimited
    pub prefetch_count: u16,
    /// Broker considers a task done as soon as it is delivered
    pub auto_ack: bool,
    pub consumer_tag: Option<ConsumerTag>,
}

impl ConsumerSession {
    /// One task at a time, explicit acknowledgement
    pub fn fair_dispatch() -> Self {
        Self {
            prefetch_count: 1,
            auto_ack: false,
            consumer_tag: None,
        }
    }

    /// Fire-and-forget consumption without acknowledgements
    pub fn auto_ack() -> Self {
        Self {
            prefetch_count: 0,
            auto_ack: true,
            consumer_tag: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_consumer_tag(mut self, tag: ConsumerTag) -> Self {
        self.consumer_tag = Some(tag);
        self
    }

    /// Capacity of the local delivery buffer for this session
    pub fn buffer_capacity(&self) -> usize {
        match self.prefetch_count {
            0 => 64,
            n => n as usize,
        }
    }
}

impl Default for ConsumerSession {
    fn default() -> Self {
        Self::fair_dispatch()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
