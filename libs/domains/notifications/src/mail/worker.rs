//! Consumer job that delivers queued emails.

use super::EmailSender;
use super::envelope::MailEnvelope;
use crate::error::NotificationError;
use amqp_worker::{JobProcessor, QueueError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Time allowed for one email, SMTP retries included.
pub const SEND_WINDOW: Duration = Duration::from_secs(120);

/// Decodes a [`MailEnvelope`] and sends it within [`SEND_WINDOW`].
///
/// Undecodable bodies are reported as job failures and therefore retried
/// like any other failure until the retry budget is spent.
pub struct MailWorker<S> {
    sender: Mutex<S>,
    window: Duration,
}

impl<S: EmailSender> MailWorker<S> {
    pub fn new(sender: S) -> Self {
        Self::with_window(sender, SEND_WINDOW)
    }

    pub fn with_window(sender: S, window: Duration) -> Self {
        Self {
            sender: Mutex::new(sender),
            window,
        }
    }

    /// Close the sender's session.
    pub async fn shutdown(&self) {
        self.sender.lock().await.quit().await;
    }
}

#[async_trait]
impl<S: EmailSender + 'static> JobProcessor for MailWorker<S> {
    async fn process(&self, message_id: &str, body: &[u8]) -> Result<(), QueueError> {
        let envelope = MailEnvelope::from_json(body)?;
        let deadline = Instant::now() + self.window;

        let mut sender = self.sender.lock().await;
        tokio::time::timeout_at(
            deadline,
            sender.send_email(&envelope.recipient, &envelope.email, deadline),
        )
        .await
        .map_err(|_| NotificationError::Timeout(self.window))??;

        info!(
            message_id = %message_id,
            recipient = %envelope.recipient,
            "Email sent"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MailWorker"
    }
}
