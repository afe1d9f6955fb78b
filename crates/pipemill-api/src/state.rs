//! Application state.

use std::sync::Arc;

use pipemill_orchestrator::Orchestrator;
use pipemill_store::{JobReader, PathResolver};

use crate::sse::SseHub;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub resolver: PathResolver,
    pub reader: Arc<JobReader>,
    pub hub: Arc<SseHub>,
    /// Present when the orchestrator runs in-process; `/api/state` degrades
    /// gracefully without it.
    pub orchestrator: Option<Arc<Orchestrator>>,
}

impl AppState {
    pub fn new(resolver: PathResolver, orchestrator: Option<Arc<Orchestrator>>) -> Self {
        let reader = Arc::new(JobReader::new(resolver.clone()));
        Self {
            resolver,
            reader,
            hub: Arc::new(SseHub::new()),
            orchestrator,
        }
    }
}
