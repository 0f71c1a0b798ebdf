//! Email delivery over the durable queue.
//!
//! ```text
//! handler ─► EmailQueue::add ─► Producer ─► queue ─► Consumer ─► MailWorker ─► SmtpClient
//! ```

mod envelope;
mod queue;
mod smtp;
mod worker;

pub use envelope::MailEnvelope;
pub use queue::EmailQueue;
pub use smtp::{SmtpClient, SmtpConfig};
pub use worker::{MailWorker, SEND_WINDOW};

use crate::error::NotificationResult;
use async_trait::async_trait;
use tokio::time::Instant;

/// Sends one rendered email, retrying internally until `deadline`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send {
    async fn send_email(
        &mut self,
        recipient: &str,
        email: &[u8],
        deadline: Instant,
    ) -> NotificationResult<()>;

    /// Release the underlying session.
    async fn quit(&mut self) {}
}
