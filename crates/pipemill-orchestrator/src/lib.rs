//! The orchestrator: watches the pending directory for seed files,
//! promotes them into `current/`, and supervises one worker process per
//! job.

pub mod dispatcher;
pub mod watcher;

pub use dispatcher::{
    Orchestrator, OrchestratorState, ProcessSpawner, SpawnedWorker, WorkerSpawner,
};
