pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::SYNC_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

async fn health_handler() -> &'static str {
    "Healthy"
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Registers the process metrics once. Safe to call before or without the server.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    SYNC_METRICS
        .get_or_init(|| async { monitoring::SyncMetrics::register(&mut registry, "sync") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "reconciler");
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state)
}

/// Serves `/health` and `/metrics` on `addr` until the shutdown token fires.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        event = "monitoring_server_listening",
        addr = %listener.local_addr()?,
        "serving health and metrics"
    );

    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;

        if let Err(err) = served {
            error!(event = "monitoring_server_failed", error = %err, "monitoring server exited");
        }
    });

    Ok(server_handle)
}
