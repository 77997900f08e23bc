use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use orchestrator_infra::admission::RejectionReason;
use orchestrator_infra::orchestrator::OrchestratorError;

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        OrchestratorError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        OrchestratorError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        OrchestratorError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        OrchestratorError::AdmissionRejected(rejection) => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(json!({
                    "error": "rate_limited",
                    "message": rejection.to_string(),
                    "reason": rejection.reason,
                })),
            )
                .into_response();
            if rejection.reason == RejectionReason::RateLimited {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
            }
            response
        }
        OrchestratorError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

pub fn json_rejection(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn query_rejection(rejection: QueryRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path segment, answering 400 `validation_error` when it is malformed.
pub fn parse_path<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()))
}
