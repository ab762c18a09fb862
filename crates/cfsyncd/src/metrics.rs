//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)
//!   GET /readyz   - Readiness probe (200 if every root's remote is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use cfsync_remote::{is_healthy, RemoteRead};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::sync::Arc;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    /// One entry per started sync root: (root id, remote reader)
    pub remotes: Arc<Vec<(String, Arc<dyn RemoteRead>)>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9101")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 200 if every remote answers, 503 naming those that don't.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.remotes.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no sync roots".to_string());
    }
    let mut down = Vec::new();
    for (id, remote) in state.remotes.iter() {
        if !is_healthy(remote.as_ref()).await {
            down.push(id.as_str());
        }
    }
    if down.is_empty() {
        (StatusCode::OK, "ready".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("remote unreachable: {}", down.join(", ")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Response;
    use cfsync_remote::MemoryRemote;
    use prometheus_client::metrics::counter::Counter;

    fn state(remote: Arc<MemoryRemote>) -> HealthState {
        let mut registry = Registry::default();
        let counter = Counter::<u64>::default();
        counter.inc();
        registry.register("cfsync_test_events", "test counter", counter);
        HealthState {
            registry: Arc::new(registry),
            remotes: Arc::new(vec![("cfsync!alice".to_string(), remote as Arc<dyn RemoteRead>)]),
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn readyz_tracks_remote_reachability() {
        let remote = Arc::new(MemoryRemote::new());
        let state = state(remote.clone());

        let ok = readyz_handler(State(state.clone())).await.into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        remote.set_unreachable(true);
        let down = readyz_handler(State(state)).await.into_response();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(down).await.contains("cfsync!alice"));
    }

    #[tokio::test]
    async fn metrics_are_encoded() {
        let state = state(Arc::new(MemoryRemote::new()));
        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("cfsync_test_events_total 1"));
    }
}
