use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use orchestrator_core::TenantId;

use crate::app::dto::TenantLimitRequest;
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/limits", get(list_limits))
        .route("/:tenant_id/limit", get(get_limit).put(put_limit))
}

/// GET /v1/tenants/limits
///
/// Every tenant with a configured or defaulted limit, ordered by id.
pub async fn list_limits(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.tenant_limits() {
        Ok(limits) => (
            StatusCode::OK,
            Json(json!({
                "limits": limits,
                "defaults": services.config.tenant_defaults,
            })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// GET /v1/tenants/:tenant_id/limit
///
/// The limit plus current usage against it.
pub async fn get_limit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match errors::parse_path(&tenant_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match services.orchestrator.tenant_usage(&tenant_id) {
        Ok(usage) => (StatusCode::OK, Json(usage)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// PUT /v1/tenants/:tenant_id/limit `{concurrency, rps, token_budget_per_min}`
pub async fn put_limit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
    body: Result<Json<TenantLimitRequest>, JsonRejection>,
) -> axum::response::Response {
    let tenant_id: TenantId = match errors::parse_path(&tenant_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };
    match services.orchestrator.set_tenant_limit(body.into_limit(tenant_id)) {
        Ok(limit) => (StatusCode::OK, Json(json!({ "limit": limit }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
