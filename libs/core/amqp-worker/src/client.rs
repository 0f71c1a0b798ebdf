//! Lazily connected AMQP client
//!
//! A `BrokerClient` owns one connection and one channel. Nothing is dialed
//! until the first call that needs the channel; after a drop the next call
//! dials again, retrying on a fixed delay until the configured deadline.

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use crate::retry::Attempts;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{debug, info, warn};

pub struct BrokerClient {
    config: QueueConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
    metrics: QueueMetrics,
}

impl BrokerClient {
    pub fn new(config: QueueConfig) -> Self {
        let metrics = QueueMetrics::new(config.queue_name.clone());
        Self {
            config,
            connection: None,
            channel: None,
            metrics,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// True when both the connection and the channel are open.
    pub fn is_connected(&self) -> bool {
        let connection_open = self
            .connection
            .as_ref()
            .is_some_and(|c| c.status().connected());
        let channel_open = self
            .channel
            .as_ref()
            .is_some_and(|c| c.status().connected());
        connection_open && channel_open
    }

    /// Return the open channel, (re)connecting first when needed.
    pub async fn connect_if_needed(&mut self) -> Result<&Channel, QueueError> {
        if self.is_connected() {
            return self.channel();
        }

        let mut attempts = Attempts::within(
            self.config.connect_timeout,
            self.config.connect_retry_delay,
        );
        let mut last_error = String::from("no attempt made");

        while attempts.next().await {
            match self.handle_connection().await {
                Ok(()) => {
                    self.metrics.reconnected();
                    info!(
                        queue = %self.config.queue_name,
                        attempt = attempts.attempt(),
                        "Connected to AMQP broker"
                    );
                    return self.channel();
                }
                Err(e) => {
                    warn!(
                        queue = %self.config.queue_name,
                        attempt = attempts.attempt(),
                        retry_in_secs = self.config.connect_retry_delay.as_secs(),
                        error = %e,
                        "AMQP connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(QueueError::Connection(format!(
            "could not connect to queue '{}' within {:?}: {}",
            self.config.queue_name, self.config.connect_timeout, last_error
        )))
    }

    /// Open whatever is closed: the connection, then a channel with QoS and
    /// the durable queue declared on it.
    async fn handle_connection(&mut self) -> Result<(), QueueError> {
        let connection_open = self
            .connection
            .as_ref()
            .is_some_and(|c| c.status().connected());

        if !connection_open {
            self.channel = None;
            debug!(queue = %self.config.queue_name, "Dialing AMQP broker");
            let connection = Connection::connect(
                &self.config.uri,
                ConnectionProperties::default()
                    .with_connection_name(self.config.connection_name.clone().into()),
            )
            .await?;
            self.connection = Some(connection);
        }

        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| QueueError::Connection("connection missing after dial".to_string()))?;

        let channel = connection.create_channel().await?;

        if let Some(prefetch) = self.config.prefetch_count {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        channel
            .queue_declare(
                &self.config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel = Some(channel);
        Ok(())
    }

    /// The currently open channel, without reconnecting.
    pub fn channel(&self) -> Result<&Channel, QueueError> {
        self.channel
            .as_ref()
            .ok_or_else(|| QueueError::Connection("channel is not open".to_string()))
    }

    /// Publish to the client's queue through the default exchange and wait
    /// for the broker to take it.
    pub async fn publish(
        &mut self,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        let queue = self.config.queue_name.clone();
        let channel = self.connect_if_needed().await?;
        publish_on(channel, &queue, body, properties).await
    }

    /// Publish on the already open channel; fails instead of reconnecting.
    pub async fn publish_now(
        &self,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        publish_on(self.channel()?, &self.config.queue_name, body, properties).await
    }

    /// Start a subscription on the client's queue with manual acknowledgement.
    pub async fn consume(&mut self, consumer_tag: &str) -> Result<Consumer, QueueError> {
        let queue = self.config.queue_name.clone();
        let channel = self.connect_if_needed().await?;
        let consumer = channel
            .basic_consume(
                &queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Close the current channel so the next call opens a fresh one on the
    /// same connection.
    pub async fn reset_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "Reset").await {
                    debug!(queue = %self.config.queue_name, error = %e, "Channel close failed");
                }
            }
        }
    }

    /// Close the channel and the connection. Errors are logged, not returned.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "Shutdown").await {
                    debug!(queue = %self.config.queue_name, error = %e, "Channel close failed");
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "Shutdown").await {
                    debug!(queue = %self.config.queue_name, error = %e, "Connection close failed");
                }
            }
            info!(queue = %self.config.queue_name, "AMQP connection closed");
        }
    }
}

async fn publish_on(
    channel: &Channel,
    queue: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), QueueError> {
    channel
        .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
        .await?
        .await?;
    Ok(())
}
