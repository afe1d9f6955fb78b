//! Jailed task-file access.

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use pipemill_core::status::FileKind;
use pipemill_core::JobId;

use crate::error::{ok_json, ApiError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub filename: Option<String>,
}

/// `GET /api/jobs/{job_id}/tasks/{task_id}/file` — return one produced
/// file, path-jailed to `files/{artifacts,logs,tmp}/`.
///
/// Text content is returned as UTF-8, anything else base64-encoded; the
/// MIME type is inferred from the extension.
pub async fn task_file(
    State(state): State<AppState>,
    Path((job_id, _task_id)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = JobId::parse(job_id)?;
    let kind: FileKind = query
        .kind
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("type query parameter is required".to_string()))?
        .parse()?;
    let filename = query
        .filename
        .as_deref()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::BadRequest("filename query parameter is required".to_string()))?;

    let (path, _location) = state.reader.find_file(&job_id, kind, filename)?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("stat file: {e}")))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("read file: {e}")))?;

    let mime = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let mtime: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);

    let (encoding, content) = match String::from_utf8(bytes) {
        Ok(text) => ("utf8", json!(text)),
        Err(err) => (
            "base64",
            json!(base64::engine::general_purpose::STANDARD.encode(err.as_bytes())),
        ),
    };

    Ok(ok_json(json!({
        "mime": mime,
        "size": metadata.len(),
        "mtime": mtime,
        "encoding": encoding,
        "content": content,
    })))
}
