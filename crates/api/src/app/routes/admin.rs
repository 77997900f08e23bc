//! Operator endpoints: manual retry, DLQ replay and queue pause.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use orchestrator_core::JobId;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/jobs/:id/retry", post(retry_job))
        .route("/queue", get(queue_state))
        .route("/queue/pause", post(pause_queue))
        .route("/queue/resume", post(resume_queue))
}

/// POST /v1/admin/jobs/:id/retry
///
/// Requeues a failed, retry-scheduled or cancelled job, or replays a
/// dead-lettered one with a fresh attempt budget.
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_path(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.admin_retry(id) {
        Ok(job) => (StatusCode::OK, Json(json!({ "job": job }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/admin/queue
pub async fn queue_state(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(json!({ "paused": services.orchestrator.is_paused() })),
    )
        .into_response()
}

/// POST /v1/admin/queue/pause
pub async fn pause_queue(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.pause() {
        Ok(changed) => (StatusCode::OK, Json(json!({ "paused": true, "changed": changed }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /v1/admin/queue/resume
pub async fn resume_queue(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.resume() {
        Ok(changed) => (StatusCode::OK, Json(json!({ "paused": false, "changed": changed }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
