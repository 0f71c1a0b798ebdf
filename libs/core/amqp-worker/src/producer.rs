//! Single-writer publishing loop.
//!
//! Callers hold a cloneable [`Publisher`]; one [`Producer`] owns the broker
//! client and is the only task that writes to the network. A publish call
//! returns once the loop has taken the body, so broker order follows the
//! order in which the loop accepted bodies.

use crate::client::BrokerClient;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use crate::shutdown::shutdown_requested;
use async_trait::async_trait;
use lapin::BasicProperties;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

type Handoff = (Vec<u8>, oneshot::Sender<()>);

/// Something that accepts message bodies for publishing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError>;
}

/// Handle used by request handlers to enqueue bodies.
#[derive(Clone)]
pub struct Publisher {
    sender: mpsc::Sender<Handoff>,
}

impl Publisher {
    /// Hand `body` to the producer loop, waiting until the loop accepts it.
    ///
    /// Dropping the returned future before acceptance cancels the publish.
    pub async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.sender
            .send((body, accepted_tx))
            .await
            .map_err(|_| QueueError::PublisherClosed)?;
        accepted_rx.await.map_err(|_| QueueError::PublisherClosed)
    }

    /// Like [`Publisher::publish`], giving up after `timeout`.
    pub async fn publish_timeout(&self, body: Vec<u8>, timeout: Duration) -> Result<(), QueueError> {
        tokio::time::timeout(timeout, self.publish(body))
            .await
            .map_err(|_| QueueError::Timeout(timeout))?
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl QueuePublisher for Publisher {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        Publisher::publish(self, body).await
    }
}

pub struct Producer {
    client: BrokerClient,
    receiver: mpsc::Receiver<Handoff>,
    metrics: QueueMetrics,
}

impl Producer {
    /// Create the loop and its first publisher handle. No connection is made yet.
    pub fn new(config: QueueConfig) -> (Self, Publisher) {
        // A one-slot buffer plus the acceptance reply makes the hand-off a rendezvous.
        let (sender, receiver) = mpsc::channel(1);
        let metrics = QueueMetrics::new(config.queue_name.clone());
        let producer = Self {
            client: BrokerClient::new(config),
            receiver,
            metrics,
        };
        (producer, Publisher { sender })
    }

    /// Publish accepted bodies until shutdown, a publish error, or every
    /// publisher is dropped.
    ///
    /// Returns `Err(QueueError::Shutdown)` on shutdown and `Ok(())` once all
    /// publishers are gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(queue = %self.client.queue_name(), "Producer started");

        let result = self.publish_loop(&mut shutdown).await;
        self.receiver.close();
        self.client.close().await;

        match &result {
            Ok(()) => info!(queue = %self.client.queue_name(), "Producer stopped: all publishers dropped"),
            Err(QueueError::Shutdown) => info!(queue = %self.client.queue_name(), "Producer stopped: shutdown"),
            Err(e) => error!(queue = %self.client.queue_name(), error = %e, "Producer stopped"),
        }
        result
    }

    async fn publish_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), QueueError> {
        loop {
            let (body, accepted) = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Err(QueueError::Shutdown),
                next = self.receiver.recv() => match next {
                    Some(handoff) => handoff,
                    None => return Ok(()),
                },
            };

            if accepted.send(()).is_err() {
                debug!(queue = %self.client.queue_name(), "Caller gave up before hand-off, skipping body");
                continue;
            }

            let message_id = Uuid::new_v4().to_string();
            let properties = BasicProperties::default()
                .with_message_id(message_id.clone().into())
                .with_delivery_mode(PERSISTENT)
                .with_content_type("application/json".into());

            if let Err(e) = self.client.publish(&body, properties).await {
                error!(
                    queue = %self.client.queue_name(),
                    message_id = %message_id,
                    error = %e,
                    "Failed to publish message"
                );
                return Err(e);
            }

            self.metrics.message_published();
            info!(
                queue = %self.client.queue_name(),
                message_id = %message_id,
                bytes = body.len(),
                "Message published"
            );
        }
    }
}
