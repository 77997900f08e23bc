use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use orchestrator_core::{JobId, SubmitJob};

use crate::app::dto::ListJobsQuery;
use crate::app::{errors, services::AppServices};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/attempts", get(get_attempts))
        .route("/:id/cancel", post(cancel_job))
}

/// POST /v1/jobs
///
/// 201 with the new job, or 200 with the original job when the idempotency
/// key was seen before. The `Idempotency-Key` header wins over the body field.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<SubmitJob>, JsonRejection>,
) -> axum::response::Response {
    let Json(mut request) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };

    if let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        match value.to_str() {
            Ok(key) => request.idempotency_key = Some(key.to_string()),
            Err(_) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "Idempotency-Key header must be visible ASCII",
                );
            }
        }
    }

    match services.orchestrator.submit(request) {
        Ok(submission) => {
            let status = if submission.idempotent_replay {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(submission)).into_response()
        }
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/jobs?status=queued&tenant=acme&model=gpt-4o&limit=50
///
/// Newest first.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return errors::query_rejection(e),
    };
    let filter = match query.filter() {
        Ok(f) => f,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    match services.orchestrator.list_jobs(&filter, query.limit) {
        Ok(jobs) => (StatusCode::OK, Json(json!({ "jobs": jobs }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_path(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.get_job(id) {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/jobs/:id/attempts
pub async fn get_attempts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_path(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.job_attempts(id) {
        Ok(attempts) => (StatusCode::OK, Json(json!({ "attempts": attempts }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// POST /v1/jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_path(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.cancel(id) {
        Ok(job) => (StatusCode::OK, Json(json!({ "job": job }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
