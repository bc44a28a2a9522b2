use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use eos_api::BridgeError;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct AppState {
    metrics_handle: PrometheusHandle,
}

/// Router с единственным `GET /metrics`.
pub fn router(metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(AppState { metrics_handle })
}

/// Pull-based metrics endpoint. Останавливается по `shutdown`.
pub async fn run(
    addr: &str,
    metrics_handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let app = router(metrics_handle);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::from(e).with_context(format!("bind metrics {addr}")))?;
    tracing::info!(%addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| BridgeError::from(e).with_context("metrics serve"))?;

    Ok(())
}

// --- GET /metrics ---

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.metrics_handle.render())
}
