use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, services::AppServices};

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// GET /v1/metrics/summary
pub async fn metrics_summary(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.metrics() {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
