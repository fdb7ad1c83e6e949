//! HTTP endpoint serving `/healthz` and Prometheus metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use libcsi::CsiIdentity;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

type Identity = Arc<dyn CsiIdentity>;

pub fn router(metrics_path: &str, identity: Identity) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(metrics_path, get(render_metrics))
        .with_state(identity)
}

/// Healthy while the driver answers probes with ready.
async fn healthz(State(identity): State<Identity>) -> Response {
    match identity.probe().await {
        Ok(true) => (StatusCode::OK, "ok").into_response(),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "driver not ready").into_response(),
        Err(e) => {
            warn!(error = %e, "driver probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn render_metrics() -> Response {
    match metrics::gather() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    metrics_path: &str,
    identity: Identity,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, metrics_path, "serving health and metrics");
    axum::serve(listener, router(metrics_path, identity))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
