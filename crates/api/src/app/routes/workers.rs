use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use orchestrator_core::WorkerId;

use crate::app::dto::{CompleteJobRequest, HeartbeatRequest, RegisterWorkerRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_workers))
        .route("/:worker_id", put(register_worker))
        .route("/:worker_id/lease", post(lease))
        .route("/:worker_id/heartbeat", post(heartbeat))
        .route("/:worker_id/complete", post(complete))
}

/// GET /v1/workers
pub async fn list_workers(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.workers() {
        Ok(workers) => (StatusCode::OK, Json(json!({ "workers": workers }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// PUT /v1/workers/:worker_id `{concurrency}`
pub async fn register_worker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
    body: Result<Json<RegisterWorkerRequest>, JsonRejection>,
) -> axum::response::Response {
    let worker_id: WorkerId = match errors::parse_path(&worker_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };
    match services.orchestrator.register_worker(&worker_id, body.concurrency) {
        Ok(worker) => (StatusCode::OK, Json(json!({ "worker": worker }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /v1/workers/:worker_id/lease
///
/// 200 `{job}` with a freshly leased job, 204 when there is nothing to do.
pub async fn lease(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
) -> axum::response::Response {
    let worker_id: WorkerId = match errors::parse_path(&worker_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.lease(&worker_id) {
        Ok(Some(job)) => (StatusCode::OK, Json(json!({ "job": job }))).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /v1/workers/:worker_id/heartbeat `{active_job_ids}`
pub async fn heartbeat(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> axum::response::Response {
    let worker_id: WorkerId = match errors::parse_path(&worker_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };
    match services.orchestrator.heartbeat(&worker_id, &body.active_job_ids) {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /v1/workers/:worker_id/complete
pub async fn complete(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
    body: Result<Json<CompleteJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let worker_id: WorkerId = match errors::parse_path(&worker_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };
    let result = body
        .into_completion()
        .and_then(|(job_id, completion)| services.orchestrator.complete(&worker_id, job_id, completion));

    match result {
        Ok(job) => (StatusCode::OK, Json(json!({ "job": job }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
