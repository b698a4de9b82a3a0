//! # Work Queue Runtime
//!
//! Durable task distribution over an AMQP 0.9.1 broker: producers publish
//! persistent tasks to a named queue, workers consume them one at a time with
//! explicit acknowledgement so busy workers are never handed more work.
//!
//! This library provides:
//! - Broker-neutral connection and channel traits
//! - An AMQP provider (RabbitMQ via `lapin`) and an in-memory broker
//! - A producer with confirmed, deadline-bound publishing
//! - A worker loop with ack / requeue / reject handling and graceful shutdown
//! - Layered settings loading (YAML file plus environment)
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`message`] - Queue names, tasks, deliveries and consumer options
//! - [`config`] - Connection and application settings
//! - [`provider`] - Provider types and configuration
//! - [`client`] - Connection and channel traits, delivery streams
//! - [`providers`] - AMQP and in-memory implementations
//! - [`producer`] - Publishing side
//! - [`worker`] - Consuming side and task handlers
//! - [`shutdown`] - Cooperative shutdown signal

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod producer;
pub mod provider;
pub mod providers;
pub mod shutdown;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use client::{with_deadline, Channel, Connection, ConnectionFactory, DeliveryStream};
pub use config::{ConnectionConfig, SettingsLoader, WorkQueueSettings};
pub use error::{ConfigError, QueueError, ValidationError};
pub use message::{
    ConsumerSession, ConsumerTag, Delivery, DeliveryMode, DeliveryTag, MessageId,
    QueueDescriptor, QueueName, Task, Timestamp,
};
pub use producer::{body_from_args, synthetic_body, Producer};
pub use provider::{InMemoryConfig, ProviderConfig, ProviderType};
pub use providers::{InMemoryBroker, QueueStats};
pub use shutdown::Shutdown;
pub use worker::{
    handler_fn, HandlerError, LoggingHandler, MarkerCostHandler, TaskHandler, Worker,
    WorkerStats,
};
