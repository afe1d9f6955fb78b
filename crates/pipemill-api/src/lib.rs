//! HTTP and SSE surface for pipemill.
//!
//! Read-only job endpoints plus seed upload, backed by the store's read
//! path. Live updates flow filesystem change -> [`detector`] ->
//! [`enhancer`] (per-job debounce + fresh re-read) -> [`sse`] hub ->
//! connected clients.

pub mod detector;
pub mod enhancer;
pub mod error;
pub mod routes;
pub mod sse;
pub mod state;

pub use enhancer::Enhancer;
pub use error::ApiError;
pub use sse::SseHub;
pub use state::AppState;
