//! API routes.

pub mod files;
pub mod health;
pub mod jobs;
pub mod state;
pub mod upload;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::sse::sse_handler;
use crate::AppState;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/upload/seed", post(upload::upload_seed))
        .route("/api/jobs", get(jobs::list_jobs))
        .route("/api/jobs/{job_id}", get(jobs::job_detail))
        .route(
            "/api/jobs/{job_id}/tasks/{task_id}/file",
            get(files::task_file),
        )
        .route("/api/events", get(sse_handler))
        .route("/api/state", get(state::state))
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
