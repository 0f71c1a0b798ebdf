//! Push Sender
//!
//! One-shot job, typically run from a scheduler: sends expiry reminders to
//! every registered iOS device, then removes devices APNs reported as gone.
//!
//! ```text
//! Postgres (ios_devices ⋈ items) ─► PushSender ─► APNs
//!                                       │ 410 / BadDeviceToken
//!                                       ▼
//!                        Redis apns_bad_token ─► CleanupService ─► Postgres
//! ```
//!
//! Metrics are written to `PUSH_METRICS_FILE` for a textfile collector once
//! both stages are done.

pub mod config;

use config::SenderConfig;
use core_config::{Environment, FromEnv};
use database::postgres::PostgresConfig;
use database::redis::RedisConfig;
use domain_notifications::{
    ApnsClient, ApnsConfig, CleanupService, NotificationError, NotificationResult,
    PostgresDeviceRepository, PushSender, RedisBadTokenStore,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How a stage ended, from the process's point of view.
#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Ran out of work.
    Completed,
    Cancelled,
    Failed(String),
}

impl StageOutcome {
    pub fn from_result(result: NotificationResult<()>) -> Self {
        match result {
            Ok(()) => StageOutcome::Completed,
            Err(e) if e.is_completion() => StageOutcome::Completed,
            Err(e) if e.is_cancelled() => StageOutcome::Cancelled,
            Err(e) => StageOutcome::Failed(e.to_string()),
        }
    }

    fn log(&self, stage: &str) {
        match self {
            StageOutcome::Completed => info!(stage, "Stage completed"),
            StageOutcome::Cancelled => warn!(stage, "Stage cancelled by shutdown"),
            StageOutcome::Failed(e) => error!(stage, error = %e, "Stage failed"),
        }
    }
}

/// Run the sender, then the cleanup service.
///
/// # Errors
///
/// Returns an error if configuration or connections fail, or if either stage
/// failed for a reason other than running out of work or shutdown.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    amqp_worker::init_metrics().wrap_err("Failed to initialize metrics")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting push sender");
    info!("Environment: {:?}", environment);

    let sender_config = SenderConfig::from_env().wrap_err("Failed to load sender configuration")?;
    let apns_config = ApnsConfig::from_env().wrap_err("Failed to load APNs configuration")?;
    let postgres_config =
        PostgresConfig::from_env().wrap_err("Failed to load database configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to PostgreSQL...");
    let db = database::postgres::connect_with_retry(&postgres_config, None)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;

    info!("Connecting to Redis...");
    let redis = database::redis::connect_with_retry(&redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let devices = Arc::new(PostgresDeviceRepository::new(db));
    let bad_tokens = Arc::new(RedisBadTokenStore::new(redis));
    let client = Arc::new(ApnsClient::new(apns_config).wrap_err("Failed to create APNs client")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let sender = PushSender::new(devices.clone(), client, bad_tokens.clone());
    let cleanup = CleanupService::new(bad_tokens, devices);
    let (sent, cleaned) = run_stages(&sender, &cleanup, shutdown_rx).await;

    if let Err(e) = amqp_worker::write_metrics_to_file(&sender_config.metrics_file).await {
        error!(
            path = %sender_config.metrics_file.display(),
            error = %e,
            "Failed to write metrics file"
        );
    }

    match (sent, cleaned) {
        (StageOutcome::Failed(e), _) => Err(eyre::eyre!("Push sender failed: {}", e)),
        (_, StageOutcome::Failed(e)) => Err(eyre::eyre!("Bad token cleanup failed: {}", e)),
        _ => {
            info!("Push sender stopped");
            Ok(())
        }
    }
}

/// Send reminders, then drain the bad-token set.
///
/// Cleanup always runs. When shutdown already stopped the sender, cleanup
/// gets a signal of its own so the tokens quarantined so far are still
/// removed; each batch stays bounded by its timeout.
pub async fn run_stages(
    sender: &PushSender,
    cleanup: &CleanupService,
    shutdown: watch::Receiver<bool>,
) -> (StageOutcome, StageOutcome) {
    let sent = StageOutcome::from_result(sender.run(shutdown.clone()).await);
    sent.log("sender");

    let cleaned = if sent == StageOutcome::Cancelled {
        info!("Sender was cancelled, cleaning up quarantined tokens before exit");
        let (_cleanup_tx, cleanup_rx) = watch::channel(false);
        StageOutcome::from_result(cleanup.run(cleanup_rx).await)
    } else {
        StageOutcome::from_result(cleanup.run(shutdown).await)
    };
    cleaned.log("cleanup");

    (sent, cleaned)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domain_notifications::{
        BadTokenStore, DeviceRepository, NotificationTask, PushClient, PushResponse,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Device table whose reminder query never ends on its own.
    #[derive(Default)]
    struct StuckDevices {
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceRepository for StuckDevices {
        async fn notifications(&self, tx: mpsc::Sender<NotificationTask>) -> NotificationResult<()> {
            tx.closed().await;
            Ok(())
        }

        async fn add_device_token(&self, _: &str, _: Uuid) -> NotificationResult<()> {
            Ok(())
        }

        async fn remove_device_tokens(&self, tokens: Vec<String>) -> NotificationResult<u64> {
            let count = tokens.len() as u64;
            self.removed.lock().unwrap().extend(tokens);
            Ok(count)
        }
    }

    struct NoPushes;

    #[async_trait]
    impl PushClient for NoPushes {
        async fn push(&self, _: &str, _: Vec<u8>) -> NotificationResult<PushResponse> {
            Err(NotificationError::Internal("unexpected push".into()))
        }
    }

    /// Set pre-filled with tokens quarantined by an earlier run.
    struct SavedTokens {
        tokens: Mutex<Vec<String>>,
        pops: AtomicUsize,
    }

    #[async_trait]
    impl BadTokenStore for SavedTokens {
        async fn save(&self, token: &str) -> NotificationResult<()> {
            self.tokens.lock().unwrap().push(token.to_string());
            Ok(())
        }

        async fn pop_batch(&self, count: usize) -> NotificationResult<Vec<String>> {
            self.pops.fetch_add(1, Ordering::SeqCst);
            let mut tokens = self.tokens.lock().unwrap();
            let keep = tokens.len().saturating_sub(count);
            Ok(tokens.split_off(keep))
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_cancelled_sender() {
        let devices = Arc::new(StuckDevices::default());
        let bad_tokens = Arc::new(SavedTokens {
            tokens: Mutex::new(vec!["t1".into(), "t2".into()]),
            pops: AtomicUsize::new(0),
        });
        let sender = PushSender::new(devices.clone(), Arc::new(NoPushes), bad_tokens.clone())
            .with_workers(2);
        let cleanup = CleanupService::new(bad_tokens.clone(), devices.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let (sent, cleaned) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_stages(&sender, &cleanup, shutdown_rx),
        )
        .await
        .unwrap();

        assert_eq!(sent, StageOutcome::Cancelled);
        assert_eq!(cleaned, StageOutcome::Completed);
        let mut removed = devices.removed.lock().unwrap().clone();
        removed.sort();
        assert_eq!(removed, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(bad_tokens.pops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sentinels_count_as_completion() {
        assert_eq!(
            StageOutcome::from_result(Err(NotificationError::SenderFinished)),
            StageOutcome::Completed
        );
        assert_eq!(
            StageOutcome::from_result(Err(NotificationError::NothingLeftToDelete)),
            StageOutcome::Completed
        );
        assert_eq!(StageOutcome::from_result(Ok(())), StageOutcome::Completed);
    }

    #[test]
    fn test_cancel_and_failure() {
        assert_eq!(
            StageOutcome::from_result(Err(NotificationError::Cancelled)),
            StageOutcome::Cancelled
        );
        assert!(matches!(
            StageOutcome::from_result(Err(NotificationError::Store("refused".into()))),
            StageOutcome::Failed(msg) if msg.contains("refused")
        ));
    }
}
