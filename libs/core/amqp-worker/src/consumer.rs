//! Queue consumer
//!
//! Runs a [`JobProcessor`] over every delivery of one queue, one message at a
//! time (prefetch 1), and settles each delivery according to its
//! `x-retry-count` header. When the delivery stream ends the subscription is
//! opened again.

use crate::client::BrokerClient;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{JobProcessor, RetryCount, Settlement};
use crate::metrics::QueueMetrics;
use crate::shutdown::shutdown_requested;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Consumer {
    client: BrokerClient,
    consumer_tag: String,
    metrics: QueueMetrics,
}

impl Consumer {
    /// Create a consumer. The prefetch count is forced to 1.
    pub fn new(config: QueueConfig) -> Self {
        let consumer_tag = format!("{}-{}", config.connection_name, Uuid::new_v4());
        let metrics = QueueMetrics::new(config.queue_name.clone());
        Self {
            client: BrokerClient::new(config.with_prefetch(1)),
            consumer_tag,
            metrics,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.client.queue_name()
    }

    /// Consume until shutdown or until the broker cannot be reached again.
    ///
    /// A job already running when shutdown arrives is finished and settled
    /// first. Returns `Err(QueueError::Shutdown)` on shutdown.
    pub async fn execute_job_on_messages<P>(
        &mut self,
        processor: &P,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>
    where
        P: JobProcessor + ?Sized,
    {
        info!(
            queue = %self.queue_name(),
            processor = processor.name(),
            "Consumer started"
        );

        let result = self.subscribe_loop(processor, &mut shutdown).await;
        self.client.close().await;

        match &result {
            Err(QueueError::Shutdown) => info!(queue = %self.queue_name(), "Consumer stopped: shutdown"),
            Err(e) => error!(queue = %self.queue_name(), error = %e, "Consumer stopped"),
            Ok(()) => info!(queue = %self.queue_name(), "Consumer stopped"),
        }
        result
    }

    async fn subscribe_loop<P>(
        &mut self,
        processor: &P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), QueueError>
    where
        P: JobProcessor + ?Sized,
    {
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Err(QueueError::Shutdown),
                subscribed = self.client.consume(&self.consumer_tag) => subscribed,
            };

            let mut deliveries = match subscribed {
                Ok(deliveries) => deliveries,
                Err(QueueError::Amqp(e)) => {
                    // Channel-level failure; open a new one after a pause.
                    warn!(queue = %self.queue_name(), error = %e, "Subscribe failed, retrying");
                    self.client.reset_channel().await;
                    let delay = self.client.config().connect_retry_delay;
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(shutdown) => return Err(QueueError::Shutdown),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            info!(queue = %self.queue_name(), consumer_tag = %self.consumer_tag, "Subscribed");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => return Err(QueueError::Shutdown),
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => self.handle_delivery(processor, delivery).await,
                    Some(Err(e)) => {
                        warn!(queue = %self.queue_name(), error = %e, "Delivery stream failed, resubscribing");
                        break;
                    }
                    None => {
                        warn!(queue = %self.queue_name(), "Delivery stream closed, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_delivery<P>(&mut self, processor: &P, delivery: Delivery)
    where
        P: JobProcessor + ?Sized,
    {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let retry = RetryCount::from_headers(delivery.properties.headers().as_ref());

        debug!(message_id = %message_id, retry_count = %retry, "Processing message");

        let started = Instant::now();
        let outcome = processor.process(&message_id, &delivery.data).await;

        match &outcome {
            Ok(()) => {
                self.metrics.job_processed(processor.name(), started.elapsed());
                info!(
                    message_id = %message_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) => {
                self.metrics.job_failed(processor.name());
                warn!(
                    message_id = %message_id,
                    retry_count = %retry,
                    error = %e,
                    "Job failed"
                );
            }
        }

        let settled = match Settlement::for_outcome(&outcome, retry) {
            Settlement::Ack => delivery
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(QueueError::from),
            Settlement::Requeue(next) => self.requeue(&delivery, &message_id, next).await,
            Settlement::Reject => {
                self.metrics.job_dropped();
                error!(
                    message_id = %message_id,
                    retry_count = %retry,
                    "Retry budget exhausted, dropping message"
                );
                delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                    .map_err(QueueError::from)
            }
        };

        if let Err(e) = settled {
            error!(message_id = %message_id, error = %e, "Failed to settle delivery");
        }
    }

    /// Put the message at the back of the queue with its retry header bumped.
    ///
    /// A broker reject cannot change headers, so the body is republished with
    /// the new count and the original delivery is acked. If the republish
    /// fails the original is rejected with requeue, keeping its old count.
    async fn requeue(
        &mut self,
        delivery: &Delivery,
        message_id: &str,
        next: RetryCount,
    ) -> Result<(), QueueError> {
        let headers = next.apply_to(delivery.properties.headers().as_ref());
        let properties = delivery.properties.clone().with_headers(headers);

        match self.client.publish_now(&delivery.data, properties).await {
            Ok(()) => {
                delivery.acker.ack(BasicAckOptions::default()).await?;
                self.metrics.job_requeued();
                info!(message_id = %message_id, retry_count = %next, "Message requeued");
                Ok(())
            }
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    error = %e,
                    "Republish failed, returning message to the queue unchanged"
                );
                delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: true })
                    .await?;
                Ok(())
            }
        }
    }
}
