//! Watcher diagnostics.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::error::{ok_json, ApiError};
use crate::AppState;

/// `GET /api/state` — health snapshot of the orchestrator.
pub async fn state(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match &state.orchestrator {
        Some(orchestrator) => Ok(ok_json(orchestrator.state().await)),
        None => Ok(ok_json(json!({
            "watching": false,
            "activeWorkers": [],
            "dataRoot": state.resolver.data_root().display().to_string(),
            "startedAt": null,
        }))),
    }
}
