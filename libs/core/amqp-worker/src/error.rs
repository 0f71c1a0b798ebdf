//! Queue error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the broker client, producer, consumer and jobs.
#[derive(Error, Debug)]
pub enum QueueError {
    /// AMQP protocol or I/O error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Could not (re)establish the broker connection before the deadline
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Job processing failed
    #[error("Job error: {0}")]
    Job(String),

    /// The producer loop is gone and no longer accepts bodies
    #[error("Publisher closed")]
    PublisherClosed,

    /// An operation did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl QueueError {
    /// Create a job failure from anything printable.
    pub fn job(message: impl Into<String>) -> Self {
        QueueError::Job(message.into())
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, QueueError::Shutdown)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
