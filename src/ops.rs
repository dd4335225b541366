//! Ops server
//!
//! Serves the observability surface on a dedicated port: liveness,
//! readiness (participates in graceful drain), JSON stats, and Prometheus
//! metrics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::balancer::{BalancerStats, CircuitBreaker, CircuitBreakerSnapshot, LruBalancer};
use crate::error::{EgretError, Result};
use crate::health::{HealthChecker, StatusInfo};
use crate::limiter::Limiter;
use crate::metrics::{StatsCollector, StatsSnapshot};

/// Shared state for ops handlers
#[derive(Clone)]
pub struct OpsState {
    pub stats: Arc<StatsCollector>,
    pub balancer: Arc<LruBalancer>,
    pub limiter: Arc<Limiter>,
    pub health: Option<Arc<HealthChecker>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub ready: Arc<AtomicBool>,
    pub started_at: Instant,
}

/// Ops HTTP server
pub struct OpsServer {
    addr: String,
    state: OpsState,
}

impl OpsServer {
    pub fn new(addr: String, state: OpsState) -> Self {
        Self { addr, state }
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .route("/stats", get(stats))
            .route("/metrics", get(metrics))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the ops server until shutdown fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|_| EgretError::InvalidConfig(format!("invalid ops address: {}", self.addr)))?;

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "ops server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| EgretError::Internal(e.to_string()))?;

        info!("ops server shut down");
        Ok(())
    }
}

async fn healthz(State(state): State<OpsState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "egret",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn readyz(State(state): State<OpsState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready" })),
        )
    }
}

#[derive(Serialize)]
struct StatsResponse {
    runtime: StatsSnapshot,
    limiter: std::collections::HashMap<String, i64>,
    balancer: BalancerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<Vec<StatusInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    circuits: Option<Vec<CircuitBreakerSnapshot>>,
}

async fn stats(State(state): State<OpsState>) -> impl IntoResponse {
    Json(StatsResponse {
        runtime: state.stats.snapshot(),
        limiter: state.limiter.stats(),
        balancer: state.balancer.get_stats(),
        health: state.health.as_ref().map(|h| h.all_status()),
        circuits: state.breaker.as_ref().map(|b| b.snapshot()),
    })
}

async fn metrics() -> axum::response::Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn test_state(ready: bool) -> OpsState {
        let ips = vec!["10.0.0.1".to_string()];
        OpsState {
            stats: Arc::new(StatsCollector::new(&ips)),
            balancer: Arc::new(LruBalancer::new(
                ips.clone(),
                Duration::from_secs(60),
                100,
                0,
                None,
                None,
                None,
            )),
            limiter: Arc::new(Limiter::new(10, 100, &ips)),
            health: None,
            breaker: None,
            ready: Arc::new(AtomicBool::new(ready)),
            started_at: Instant::now(),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_reports_healthy() {
        let response = healthz(State(test_state(true))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = body_json(response).await;
        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["service"], "egret");
    }

    #[tokio::test]
    async fn test_readyz_flips_with_flag() {
        let state = test_state(true);

        let response = readyz(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.ready.store(false, Ordering::Relaxed);
        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload = body_json(response).await;
        assert_eq!(payload["status"], "not ready");
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let state = test_state(true);
        state.stats.inc_total_requests();
        state.balancer.record("example.com", "10.0.0.1");

        let response = stats(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = body_json(response).await;
        assert_eq!(payload["runtime"]["total_requests"], 1);
        assert_eq!(payload["balancer"]["total_entries"], 1);
        assert_eq!(payload["limiter"]["total"], 0);
        assert!(payload.get("health").is_none());
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        // Touch a metric so the gather is non-empty
        crate::metrics::REQUESTS_TOTAL
            .with_label_values(&["GET", "200"])
            .inc();

        let response = metrics().await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("egret_requests_total"));
    }
}
