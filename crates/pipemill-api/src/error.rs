//! API error handling.
//!
//! All responses use the `{ok, data?, error?, message?}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Internal(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = self.code();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Internal(msg) => msg,
        };

        let body = Json(json!({
            "ok": false,
            "error": code,
            "message": message,
        }));
        (status, body).into_response()
    }
}

impl From<pipemill_core::Error> for ApiError {
    fn from(err: pipemill_core::Error) -> Self {
        use pipemill_core::Error;
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Success envelope.
pub fn ok_json<T: serde::Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": data }))
}
