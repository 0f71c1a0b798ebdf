//! AMQP Worker Framework
//!
//! Publishing and consuming over a durable RabbitMQ queue.
//!
//! ## Features
//!
//! - **Lazy broker client**: connects on first use, redials on a fixed delay until a deadline
//! - **Single-writer producer**: `Publisher` handles hand bodies to one `Producer` loop
//! - **Sequential consumer**: prefetch 1, resubscribes when the delivery stream ends
//! - **Retry budget**: `x-retry-count` header, requeue below 3, drop at 3
//! - **Prometheus metrics**: Built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{Consumer, JobProcessor, Producer, QueueConfig};
//!
//! let config = QueueConfig::from_env()?;
//!
//! let (producer, publisher) = Producer::new(config.clone());
//! tokio::spawn(producer.run(shutdown_rx.clone()));
//! publisher.publish(serde_json::to_vec(&payload)?).await?;
//!
//! let mut consumer = Consumer::new(config);
//! consumer.execute_job_on_messages(&my_processor, shutdown_rx).await?;
//! ```

mod client;
mod config;
mod consumer;
mod error;
mod job;
pub mod metrics;
mod producer;
pub mod retry;
pub mod shutdown;

// Re-export main types
pub use client::BrokerClient;
pub use config::{DEFAULT_QUEUE_NAME, QueueConfig};
pub use consumer::Consumer;
pub use error::QueueError;
pub use job::{JobProcessor, RETRY_COUNT_HEADER, RetryCount, Settlement};
pub use metrics::{QueueMetrics, init_metrics, render_metrics, write_metrics_to_file};
pub use producer::{Producer, Publisher, QueuePublisher};
pub use retry::Attempts;
pub use shutdown::shutdown_requested;
