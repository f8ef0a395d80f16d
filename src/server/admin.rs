//! Admin HTTP API.
//!
//! Read-only views of a running server:
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /v1/cache/events (SSE stream of stats snapshots)
//! - GET /metrics (Prometheus text format)

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::server::metrics::ServerMetrics;
use crate::server::orchestrator::CacheStats;
use crate::server::streaming::stats_to_sse_stream;

/// State shared across handlers.
pub struct AdminState {
    pub stats: watch::Receiver<CacheStats>,
    pub metrics: Arc<ServerMetrics>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/events", get(cache_events))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

async fn health(State(state): State<Arc<AdminState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.stats.borrow().clone(),
    })
}

async fn cache_stats(State(state): State<Arc<AdminState>>) -> Json<CacheStats> {
    Json(state.stats.borrow().clone())
}

async fn cache_events(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Sse::new(stats_to_sse_stream(state.stats.clone())).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AdminState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn stats() -> CacheStats {
        CacheStats {
            node_name: "node-a".to_string(),
            used_bytes: 12,
            capacity_bytes: 1024,
            items: 1,
            max_items: 0,
            clients: 2,
            add_tasks: 0,
            get_tasks: 0,
            relays_pending: 0,
            relays_in_flight: 0,
            upstream: None,
        }
    }

    fn router() -> (Router, watch::Sender<CacheStats>, Arc<ServerMetrics>) {
        let (tx, rx) = watch::channel(stats());
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let state = Arc::new(AdminState {
            stats: rx,
            metrics: metrics.clone(),
            start_time: Instant::now(),
        });
        (build_router(state), tx, metrics)
    }

    async fn get_json(router: Router, uri: &str) -> serde_json::Value {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _tx, _metrics) = router();
        let body = get_json(router, "/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cache"]["node_name"], "node-a");
    }

    #[tokio::test]
    async fn test_stats_follow_watch() {
        let (router, tx, _metrics) = router();
        let mut updated = stats();
        updated.items = 7;
        tx.send_replace(updated);

        let body = get_json(router, "/v1/cache/stats").await;
        assert_eq!(body["items"], 7);
        assert!(body["upstream"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let (router, _tx, metrics) = router();
        metrics.misses.inc();

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("asset_cache_misses_total 1"));
    }
}
