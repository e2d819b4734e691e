use crate::services::metrics;
use axum::{http::header, response::IntoResponse};

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::get_metrics(),
    )
}
