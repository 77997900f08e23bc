//! Event log endpoints: polling and a live SSE feed.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::app::dto::EventsQuery;
use crate::app::{errors, services::{self, AppServices}};

const DEFAULT_LIMIT: usize = 100;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_events))
        .route("/stream", get(stream_events))
}

/// GET /v1/events?after=42&limit=100
///
/// With `after`: retained events with a greater `seq`, oldest first, for
/// cursor-style polling. Without it: the most recent events, newest first.
pub async fn list_events(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return errors::query_rejection(e),
    };

    let max = services.config.event_log_capacity;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT.min(max));
    if limit == 0 || limit > max {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("limit must be between 1 and {max}"),
        );
    }

    let result = match query.after {
        Some(after) => services.orchestrator.events_since(after, limit),
        None => services.orchestrator.recent_events(limit),
    };
    let last_seq = match services.orchestrator.last_event_seq() {
        Ok(seq) => seq,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    match result {
        Ok(events) => (
            StatusCode::OK,
            Json(json!({ "events": events, "last_seq": last_seq })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/events/stream?after=42
///
/// Server-Sent Events; each message's `event` is the event type and `id` its
/// sequence number.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return errors::query_rejection(e),
    };
    services::event_sse_stream(services, query.after).into_response()
}
