//! Notifications Domain
//!
//! Outbound delivery for expiry reminders: queued email and APNs pushes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                     ┌─────────────────┐
//! │   API Handler   │                     │  Device Query   │  ← items expiring in 25h
//! └────────┬────────┘                     └────────┬────────┘
//!          │ EmailQueue::add                       │
//! ┌────────▼────────┐                     ┌────────▼────────┐
//! │    RabbitMQ     │  ← emails queue     │   PushSender    │  ← 20 workers
//! └────────┬────────┘                     └────────┬────────┘
//!          │                                       │
//! ┌────────▼────────┐                     ┌────────▼────────┐
//! │   MailWorker    │  ← retry budget 3   │      APNs       │
//! └────────┬────────┘                     └────────┬────────┘
//!          │                                       │ bad tokens
//! ┌────────▼────────┐                     ┌────────▼────────┐
//! │   SMTP relay    │                     │ Redis + Cleanup │
//! └─────────────────┘                     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use amqp_worker::{Producer, QueueConfig};
//! use domain_notifications::EmailQueue;
//!
//! let (producer, publisher) = Producer::new(QueueConfig::from_env()?);
//! tokio::spawn(producer.run(shutdown_rx));
//!
//! let queue = EmailQueue::new(publisher);
//! queue.add("user@example.com", rendered_email).await?;
//! ```

pub mod error;
pub mod mail;
pub mod metrics;
pub mod push;

// Re-export commonly used types
pub use error::{NotificationError, NotificationResult};
pub use mail::{EmailQueue, EmailSender, MailEnvelope, MailWorker, SmtpClient, SmtpConfig};
pub use metrics::PushMetrics;
pub use push::{
    ApnsClient, ApnsConfig, BadTokenStore, CleanupService, DeviceRepository, NotificationTask,
    PostgresDeviceRepository, PushClient, PushResponse, PushSender, RedisBadTokenStore,
};
