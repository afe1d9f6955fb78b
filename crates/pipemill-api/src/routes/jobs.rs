//! Job listing and detail.

use axum::extract::{Path, State};
use axum::Json;

use pipemill_core::JobId;
use pipemill_store::transform;

use crate::error::{ok_json, ApiError};
use crate::AppState;

/// `GET /api/jobs` — canonical summaries across `current` and `complete`.
pub async fn list_jobs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summaries: Vec<_> = state
        .reader
        .list_jobs()
        .iter()
        .map(transform::summarize)
        .collect();
    Ok(ok_json(summaries))
}

/// `GET /api/jobs/{job_id}` — canonical detail for one job.
pub async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = JobId::parse(job_id)?;
    let raw = state.reader.read_job(&job_id)?;
    Ok(ok_json(transform::summarize(&raw)))
}
