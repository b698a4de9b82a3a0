//! Broker provider implementations.
//!
//! This module contains concrete implementations of the `Connection` and
//! `Channel` traits for different broker backends.

pub mod amqp;
pub mod memory;

pub use amqp::{AmqpChannel, AmqpConnection};
pub use memory::{InMemoryBroker, InMemoryChannel, InMemoryConnection, QueueStats};
