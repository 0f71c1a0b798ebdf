//! Email Worker Service
//!
//! Delivers queued reminder emails over SMTP.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ (emails queue, prefetch 1 per worker)
//!   ↓
//! Consumer × EMAIL_WORKER_COUNT
//!   ↓ (x-retry-count: requeue below 3, drop at 3)
//! MailWorker (2 minute send window)
//!   ↓
//! SmtpClient (implicit TLS, one session per worker)
//! ```
//!
//! ## Features
//!
//! - Independent worker pipelines, each with its own broker channel and SMTP session
//! - Broker reconnect every 15s within a 2 minute window
//! - Graceful shutdown on SIGINT/SIGTERM, sessions closed with QUIT
//! - Health and Prometheus endpoints

pub mod config;
pub mod health;

use amqp_worker::{Consumer, QueueConfig, QueueError};
use config::WorkerConfig;
use core_config::{Environment, FromEnv};
use domain_notifications::{MailWorker, SmtpClient, SmtpConfig};
use eyre::{Result, WrapErr};
use health::{HealthState, health_router};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn start_health_server(state: HealthState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, health_router(state))
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the email worker
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Loads broker, SMTP and worker settings
/// 3. Starts `EMAIL_WORKER_COUNT` worker pipelines and the health server
/// 4. Waits until every worker has stopped
///
/// # Errors
///
/// Returns an error if configuration is invalid, or if every worker stopped
/// on its own before shutdown was requested.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    amqp_worker::init_metrics().wrap_err("Failed to initialize metrics")?;

    info!(name = APP_NAME, version = APP_VERSION, "Starting email worker service");
    info!("Environment: {:?}", environment);

    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let queue_config = QueueConfig::from_env()
        .wrap_err("Failed to load queue configuration")?
        .with_connection_name(APP_NAME);
    let smtp_config = SmtpConfig::from_env().wrap_err("Failed to load SMTP configuration")?;

    info!(
        workers = worker_config.worker_count,
        queue = %queue_config.queue_name,
        smtp_host = %smtp_config.host,
        "Worker configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(APP_NAME, APP_VERSION);
    let health_port = worker_config.health_port;
    let server_state = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(server_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut workers = JoinSet::new();
    for number in 1..=worker_config.worker_count {
        workers.spawn(run_worker(
            number,
            queue_config.clone(),
            smtp_config.clone(),
            worker_config.clone(),
            health_state.clone(),
            shutdown_rx.clone(),
        ));
    }

    let mut failed = 0;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!(error = %e, "Email worker stopped with error");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Email worker panicked");
            }
        }
    }

    if !*shutdown_rx.borrow() && failed == worker_config.worker_count {
        return Err(eyre::eyre!("All {} email workers failed", failed));
    }

    info!("Email worker service stopped");
    Ok(())
}

/// One pipeline: SMTP session, broker consumer, mail job.
///
/// Returns `Ok` when stopped by shutdown.
async fn run_worker(
    number: usize,
    queue_config: QueueConfig,
    smtp_config: SmtpConfig,
    worker_config: WorkerConfig,
    health: HealthState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(worker_number = number, "Email worker starting");

    let client = SmtpClient::connect(smtp_config, worker_config.smtp_init_window)
        .await
        .wrap_err_with(|| format!("Worker {} failed to open SMTP session", number))?;
    let job = MailWorker::new(client);
    let mut consumer = Consumer::new(queue_config);

    let _running = health.worker_guard();
    info!(worker_number = number, "Email worker running");
    let outcome = consumer.execute_job_on_messages(&job, shutdown).await;

    job.shutdown().await;

    match outcome {
        Ok(()) | Err(QueueError::Shutdown) => {
            info!(worker_number = number, "Email worker stopped");
            Ok(())
        }
        Err(e) => {
            warn!(worker_number = number, error = %e, "Email worker consumer failed");
            Err(e).wrap_err_with(|| format!("Worker {} consumer failed", number))
        }
    }
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
