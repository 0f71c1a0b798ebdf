//! Push delivery metrics.
//!
//! Recorded through the global `metrics` recorder; the process installs it
//! with [`amqp_worker::metrics::init_metrics`].

use chrono::Utc;
use metrics::{counter, gauge};

const ENTITY: &str = "apns";

#[derive(Clone, Copy, Default)]
pub struct PushMetrics;

impl PushMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn push_succeeded(&self) {
        counter!("apns_attempts_total", "entity" => ENTITY, "result" => "success").increment(1);
    }

    pub fn push_failed(&self) {
        counter!("apns_attempts_total", "entity" => ENTITY, "result" => "fail").increment(1);
    }

    pub fn bad_token_saved(&self) {
        counter!("apns_bad_tokens_saved_total").increment(1);
    }

    pub fn bad_tokens_deleted(&self, count: u64) {
        counter!("apns_bad_tokens_deleted_total").increment(count);
    }

    /// Unix time the sender started.
    pub fn run_started(&self) {
        gauge!("apns_start_timestamp_seconds", "entity" => ENTITY).set(Utc::now().timestamp() as f64);
    }

    /// Unix time the sender finished.
    pub fn run_finished(&self) {
        gauge!("apns_finish_timestamp_seconds", "entity" => ENTITY).set(Utc::now().timestamp() as f64);
    }
}
