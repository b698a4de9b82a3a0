//! Error types for queue operations.

use crate::message::{DeliveryTag, QueueDescriptor};
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all broker operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Queue '{queue_name}' already exists with different attributes (declared {requested}, existing {existing})")]
    DeclareMismatch {
        queue_name: String,
        requested: String,
        existing: String,
    },

    #[error("Queue '{queue_name}' is exclusive to another connection")]
    QueueLocked { queue_name: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue '{queue_name}' is full ({max_length} tasks)")]
    QueueFull { queue_name: String, max_length: usize },

    #[error("Unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: DeliveryTag },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Build a declare mismatch error from the two conflicting descriptors
    pub fn declare_mismatch(requested: &QueueDescriptor, existing: &QueueDescriptor) -> Self {
        Self::DeclareMismatch {
            queue_name: requested.name.to_string(),
            requested: requested.attributes(),
            existing: existing.attributes(),
        }
    }

    /// Check if error should terminate the process
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::ConnectionLost { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::Timeout { .. } => false,
            Self::DeclareMismatch { .. } => true,
            Self::QueueLocked { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::QueueFull { .. } => false,
            Self::UnknownDeliveryTag { .. } => false,
            Self::ProviderError { .. } => false,
            Self::Configuration(_) => true,
            Self::Validation(_) => false,
        }
    }

    /// Check if error is transient and the caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::QueueFull { .. } | Self::ProviderError { .. }
        )
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::QueueFull { .. } => Some(Duration::from_secs(5)),
            Self::ProviderError { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to write configuration to {path}: {message}")]
    Write { path: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
