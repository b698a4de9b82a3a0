//! Provider types and configuration.

use crate::config::ConnectionConfig;
use crate::providers::InMemoryBroker;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Enumeration of supported broker providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    Amqp,
    InMemory,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::InMemory => "in-memory",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific connection target
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    /// A RabbitMQ (or other AMQP 0.9.1) broker
    Amqp(ConnectionConfig),
    /// A shared in-process broker
    InMemory(InMemoryBroker),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Amqp(_) => ProviderType::Amqp,
            Self::InMemory(_) => ProviderType::InMemory,
        }
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of ready tasks per queue, unlimited when `None`
    pub max_queue_length: Option<usize>,
    /// Delay before a publish is confirmed
    pub confirm_delay: Option<Duration>,
}
