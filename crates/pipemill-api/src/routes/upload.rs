//! Seed upload.

use axum::extract::{FromRequest, Multipart, Request, State};
use axum::Json;
use serde_json::json;
use tracing::info;

use pipemill_core::{JobId, Seed};
use pipemill_store::atomic::write_atomic;
use pipemill_store::PathResolver;

use crate::error::{ok_json, ApiError};
use crate::AppState;

/// `POST /api/upload/seed` — accepts a seed as a JSON body or as a
/// multipart file, validates it, assigns a job id, and writes the seed
/// into `pending/` atomically.
pub async fn upload_seed(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bytes = seed_bytes(request).await?;
    let seed = Seed::from_json(&bytes)?;

    if name_occupied(&state.resolver, &seed.name) {
        return Err(ApiError::BadRequest(format!(
            "A job named {:?} already exists",
            seed.name
        )));
    }

    let job_id = JobId::generate();
    let body = serde_json::to_vec_pretty(&seed)
        .map_err(|e| ApiError::Internal(format!("serialize seed: {e}")))?;
    write_atomic(&state.resolver.pending_seed(&job_id), &body)
        .map_err(|e| ApiError::Internal(format!("write seed: {e}")))?;

    info!(job_id = %job_id, name = %seed.name, "seed uploaded");
    state.hub.seed_uploaded(&seed.name);

    Ok(ok_json(json!({ "jobId": job_id, "name": seed.name })))
}

/// Raw JSON body, or the first file field of a multipart form.
async fn seed_bytes(request: Request) -> Result<Vec<u8>, ApiError> {
    let is_multipart = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if !is_multipart {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_SEED_BYTES)
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
        return Ok(bytes.to_vec());
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.file_name().is_some() || field.name() == Some("seed") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("unreadable seed file: {e}")))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::BadRequest(
        "Required fields missing: seed file".to_string(),
    ))
}

const MAX_SEED_BYTES: usize = 4 * 1024 * 1024;

/// A seed name is taken while a seed with that name sits in `pending/` or
/// owns a directory in `current/`.
fn name_occupied(resolver: &PathResolver, name: &str) -> bool {
    if let Ok(entries) = std::fs::read_dir(resolver.pending_root()) {
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.path().extension().is_none_or(|e| e != "json") {
                continue;
            }
            if seed_name_at(&entry.path()).as_deref() == Some(name) {
                return true;
            }
        }
    }
    if let Ok(entries) = std::fs::read_dir(resolver.current_root()) {
        for entry in entries.filter_map(|e| e.ok()) {
            if seed_name_at(&entry.path().join("seed.json")).as_deref() == Some(name) {
                return true;
            }
        }
    }
    false
}

fn seed_name_at(path: &std::path::Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("name")?.as_str().map(String::from)
}
