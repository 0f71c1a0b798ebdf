//! Removes quarantined device tokens from the devices table.

use super::bad_tokens::{BadTokenStore, CLEANUP_BATCH_SIZE};
use super::devices::DeviceRepository;
use crate::error::{NotificationError, NotificationResult};
use crate::metrics::PushMetrics;
use amqp_worker::shutdown::shutdown_requested;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Time allowed for one pop-and-delete batch.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Drains the bad-token set in batches of [`CLEANUP_BATCH_SIZE`].
///
/// Popping and deleting are two separate operations: a batch whose delete
/// fails is lost from the set.
pub struct CleanupService {
    bad_tokens: Arc<dyn BadTokenStore>,
    devices: Arc<dyn DeviceRepository>,
    batch_size: usize,
    batch_timeout: Duration,
    metrics: PushMetrics,
}

impl CleanupService {
    pub fn new(bad_tokens: Arc<dyn BadTokenStore>, devices: Arc<dyn DeviceRepository>) -> Self {
        Self {
            bad_tokens,
            devices,
            batch_size: CLEANUP_BATCH_SIZE,
            batch_timeout: BATCH_TIMEOUT,
            metrics: PushMetrics::new(),
        }
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    /// Runs until the set is empty. Never returns `Ok`: an empty set ends the
    /// run with [`NotificationError::NothingLeftToDelete`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> NotificationResult<()> {
        let mut total = 0u64;
        loop {
            let removed = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    info!(total, "Cleanup cancelled");
                    return Err(NotificationError::Cancelled);
                }
                batch = tokio::time::timeout(self.batch_timeout, self.clean_batch()) => {
                    batch.map_err(|_| NotificationError::Timeout(self.batch_timeout))??
                }
            };

            match removed {
                Some(removed) => total += removed,
                None => {
                    info!(total, "Cleanup finished");
                    return Err(NotificationError::NothingLeftToDelete);
                }
            }
        }
    }

    /// `None` when there was nothing to pop.
    async fn clean_batch(&self) -> NotificationResult<Option<u64>> {
        let tokens = self.bad_tokens.pop_batch(self.batch_size).await?;
        if tokens.is_empty() {
            return Ok(None);
        }

        let popped = tokens.len();
        let removed = self.devices.remove_device_tokens(tokens).await?;
        self.metrics.bad_tokens_deleted(removed);
        debug!(popped, removed, "Bad token batch deleted");
        Ok(Some(removed))
    }
}
