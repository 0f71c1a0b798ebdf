//! Error types for the notifications domain.

use amqp_worker::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// SMTP session or transaction error.
    #[error("SMTP error: {0}")]
    Smtp(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    /// Queue body could not be decoded or encoded.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Apple Push service request failed.
    #[error("APNs error: {0}")]
    Apns(String),

    /// Provider token could not be signed.
    #[error("Provider token error: {0}")]
    ProviderToken(String),

    /// Message queue error.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Bad-token store (Redis) error.
    #[error("Bad-token store error: {0}")]
    Store(String),

    /// Database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation did not finish within its window.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The push sender drained every task. Returned even when all pushes succeeded.
    #[error("apns sender is shutdown after it finished all job")]
    SenderFinished,

    /// The bad-token set is empty.
    #[error("nothing left to delete: no saved bad tokens left")]
    NothingLeftToDelete,

    /// Stopped by the shutdown signal.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    /// True for the errors that mark a run that simply ran out of work.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            NotificationError::SenderFinished | NotificationError::NothingLeftToDelete
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NotificationError::Cancelled)
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Store(err.to_string())
    }
}

impl From<sea_orm::DbErr> for NotificationError {
    fn from(err: sea_orm::DbErr) -> Self {
        NotificationError::DatabaseError(err.to_string())
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::Apns(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for NotificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        NotificationError::ProviderToken(err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::Smtp(err.to_string())
    }
}

impl From<lettre::address::AddressError> for NotificationError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotificationError::InvalidEmail(err.to_string())
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::InvalidEmail(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::InvalidEnvelope(format!("JSON error: {}", err))
    }
}

impl From<core_config::ConfigError> for NotificationError {
    fn from(err: core_config::ConfigError) -> Self {
        NotificationError::ConfigError(err.to_string())
    }
}

/// Job failures reported back to the consumer spend the message's retry budget.
impl From<NotificationError> for QueueError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::Queue(inner) => inner,
            other => QueueError::job(other.to_string()),
        }
    }
}
