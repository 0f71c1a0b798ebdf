//! Enqueueing side of email delivery, used by request handlers.

use super::envelope::MailEnvelope;
use crate::error::NotificationResult;
use amqp_worker::{Publisher, QueuePublisher};
use tracing::debug;

/// Puts rendered emails on the queue through the producer loop.
///
/// Built once at startup and shared; cloning shares the same producer.
#[derive(Clone)]
pub struct EmailQueue<P = Publisher> {
    publisher: P,
}

impl<P: QueuePublisher> EmailQueue<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// Encode and hand off one email. Returns once the producer accepted it.
    pub async fn add(&self, recipient: &str, email: Vec<u8>) -> NotificationResult<()> {
        let body = MailEnvelope::new(recipient, email).to_json()?;
        self.publisher.publish(body).await?;
        debug!(recipient = %recipient, "Email queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use amqp_worker::QueueError;
    use async_trait::async_trait;

    mockall::mock! {
        pub Publisher {}

        #[async_trait]
        impl QueuePublisher for Publisher {
            async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError>;
        }
    }

    #[tokio::test]
    async fn test_add_publishes_encoded_envelope() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|body| {
                MailEnvelope::from_json(body).unwrap()
                    == MailEnvelope::new("a@example.com", b"Subject: hi\r\n\r\nbody".to_vec())
            })
            .times(1)
            .returning(|_| Ok(()));

        let queue = EmailQueue::new(publisher);
        queue
            .add("a@example.com", b"Subject: hi\r\n\r\nbody".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_surfaces_closed_producer() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .returning(|_| Err(QueueError::PublisherClosed));

        let queue = EmailQueue::new(publisher);
        let err = queue.add("a@example.com", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            NotificationError::Queue(QueueError::PublisherClosed)
        ));
    }
}
