//! Error types for broker operations.

use std::time::Duration;
use thiserror::Error;

/// Main error type for broker operations.
///
/// Failures raised by subscriber handlers never surface here; they are
/// logged and counted by the delivery strategy that ran the handler.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Subscriber already registered: {0}")]
    DuplicateSubscriber(String),

    #[error("Subscriber not registered: {0}")]
    UnknownSubscriber(String),

    #[error("Invalid retention: {0:?}")]
    InvalidRetention(Duration),

    #[error("Broker already exists: {0}")]
    BrokerExists(String),

    #[error("Failed to start worker thread: {0}")]
    Worker(#[from] std::io::Error),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
