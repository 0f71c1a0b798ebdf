//! Liveness and metrics endpoints.
//!
//! - `/health`, `/healthz` - liveness, with the number of running workers
//! - `/metrics` - Prometheus text format

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    running: Arc<AtomicUsize>,
}

impl HealthState {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mark one worker as running until the guard is dropped.
    pub fn worker_guard(&self) -> RunningGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunningGuard {
            running: self.running.clone(),
        }
    }

    pub fn workers_running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
    pub workers_running: usize,
}

/// 200 while at least one worker runs, 503 otherwise.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let workers_running = state.workers_running();
    let (status, label) = if workers_running > 0 {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status,
        Json(HealthResponse {
            status: label,
            name: state.app_name,
            version: state.app_version,
            workers_running,
        }),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match amqp_worker::metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_health(state: HealthState) -> (StatusCode, serde_json::Value) {
        let response = health_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_unhealthy_without_workers() {
        let (status, body) = get_health(HealthState::new("email-worker", "0.1.0")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["workers_running"], 0);
    }

    #[tokio::test]
    async fn test_guard_tracks_running_workers() {
        let state = HealthState::new("email-worker", "0.1.0");
        let first = state.worker_guard();
        let _second = state.worker_guard();
        assert_eq!(state.workers_running(), 2);

        let (status, body) = get_health(state.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "email-worker");

        drop(first);
        assert_eq!(state.workers_running(), 1);
    }
}
