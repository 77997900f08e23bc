use axum::{routing::get, Router};

pub mod admin;
pub mod events;
pub mod jobs;
pub mod system;
pub mod tenants;
pub mod workers;

/// Router for all versioned endpoints (mounted under `/v1`).
pub fn router() -> Router {
    Router::new()
        .route("/metrics/summary", get(system::metrics_summary))
        .nest("/jobs", jobs::router())
        .nest("/workers", workers::router())
        .nest("/tenants", tenants::router())
        .nest("/events", events::router())
        .nest("/admin", admin::router())
}
