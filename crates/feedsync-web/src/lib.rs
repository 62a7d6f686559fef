//! Health and metrics HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use feedsync_storage::SetClient;
use feedsync_sync::SyncMetrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "feedsync-web";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub set: SetClient,
    pub metrics: Arc<SyncMetrics>,
}

impl AppState {
    pub fn new(set: SetClient, metrics: Arc<SyncMetrics>) -> Self {
        Self { set, metrics }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    address: &str,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    serve_on(listener, state, cancel).await
}

/// Serve until `cancel` fires, then finish in-flight requests and return.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server failed")?;
    info!("http server stopped");
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.set.ping().await.into_result() {
        Ok(_) => (StatusCode::OK, "All is well!").into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to connect to the database").into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(),
    )
        .into_response()
}
