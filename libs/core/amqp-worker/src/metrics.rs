//! Prometheus metrics for queue workers
//!
//! Provides observability into publishing, job outcomes and reconnects.

use metrics::counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Write the current metrics in text exposition format, for a textfile collector.
///
/// Parent directories are created when missing.
pub async fn write_metrics_to_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, render_metrics()).await?;
    info!(path = %path.display(), "Metrics written to file");
    Ok(())
}

/// Queue metrics helper
#[derive(Clone)]
pub struct QueueMetrics {
    /// Queue name for labeling
    queue_name: String,
}

impl QueueMetrics {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }

    /// Record a message accepted by the broker
    pub fn message_published(&self) {
        counter!(
            "amqp_worker_messages_published_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Record a job finishing successfully
    pub fn job_processed(&self, processor: &'static str, duration: Duration) {
        counter!(
            "amqp_worker_jobs_processed_total",
            "queue" => self.queue_name.clone(),
            "processor" => processor,
            "status" => "success"
        )
        .increment(1);

        metrics::histogram!(
            "amqp_worker_job_duration_seconds",
            "queue" => self.queue_name.clone(),
            "processor" => processor
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failing
    pub fn job_failed(&self, processor: &'static str) {
        counter!(
            "amqp_worker_jobs_processed_total",
            "queue" => self.queue_name.clone(),
            "processor" => processor,
            "status" => "failed"
        )
        .increment(1);
    }

    /// Record a failed message being put back on the queue
    pub fn job_requeued(&self) {
        counter!(
            "amqp_worker_jobs_requeued_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Record a message dropped after its retry budget ran out
    pub fn job_dropped(&self) {
        counter!(
            "amqp_worker_jobs_dropped_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Record a successful (re)connect to the broker
    pub fn reconnected(&self) {
        counter!(
            "amqp_worker_reconnects_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }
}
