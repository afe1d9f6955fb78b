//! The status writer: the only component permitted to mutate
//! `tasks-status.json`.
//!
//! Every write goes copy -> mutate -> validate -> stamp -> atomic persist ->
//! publish. A failed validation aborts the write and leaves the prior
//! snapshot, in memory and on disk, untouched.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use pipemill_core::status::JobSnapshot;
use pipemill_core::{Error, Result};

use crate::atomic::write_atomic;

/// Serialize and atomically persist a snapshot. Used directly by the
/// orchestrator for the initial write; workers go through [`StatusStore`].
pub fn persist_snapshot(path: &Path, snapshot: &JobSnapshot) -> Result<()> {
    snapshot.validate()?;
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| Error::FatalIo(format!("serialize snapshot: {e}")))?;
    write_atomic(path, &bytes).map_err(|e| Error::FatalIo(format!("persist snapshot: {e}")))
}

/// Owner of one job's status document.
///
/// Within a worker all writes are serialized through the internal mutex;
/// across processes, exclusivity comes from the single-writer invariant
/// (only the worker owning a job writes).
pub struct StatusStore {
    path: PathBuf,
    snapshot: Mutex<JobSnapshot>,
}

impl StatusStore {
    /// Create the store for a fresh snapshot, persisting it immediately.
    pub fn create(path: impl Into<PathBuf>, snapshot: JobSnapshot) -> Result<Self> {
        let path = path.into();
        persist_snapshot(&path, &snapshot)?;
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Load an existing status document.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::FatalIo(format!("read {}: {e}", path.display())))?;
        let snapshot: JobSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| Error::FatalIo(format!("parse {}: {e}", path.display())))?;
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Current in-memory snapshot.
    pub async fn snapshot(&self) -> JobSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Apply a mutation, validate, stamp `lastUpdated`, persist, publish.
    ///
    /// `lastUpdated` is monotonically non-decreasing even if the wall clock
    /// steps backwards.
    pub async fn update<F>(&self, mutate: F) -> Result<JobSnapshot>
    where
        F: FnOnce(&mut JobSnapshot),
    {
        let mut guard = self.snapshot.lock().await;
        let mut next = guard.clone();
        mutate(&mut next);
        next.validate()?;
        next.last_updated = Utc::now().max(guard.last_updated);

        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| Error::FatalIo(format!("serialize snapshot: {e}")))?;
        write_atomic(&self.path, &bytes)
            .map_err(|e| Error::FatalIo(format!("persist snapshot: {e}")))?;

        *guard = next;
        debug!(job_id = %guard.id, state = guard.state.as_str(), "snapshot persisted");
        Ok(guard.clone())
    }

    /// Return a task to `pending`, clearing attempts, refinement counters,
    /// failure bookkeeping, and optionally token usage. Registered files
    /// are preserved; other tasks are untouched. The job-level state is
    /// re-derived so the invariants keep holding.
    pub async fn reset_single_task(
        &self,
        task_id: &str,
        clear_token_usage: bool,
    ) -> Result<JobSnapshot> {
        let task_id = task_id.to_string();
        self.update(move |snap| {
            if let Some(task) = snap.tasks.get_mut(&task_id) {
                task.reset(clear_token_usage);
            }
            snap.state = JobSnapshot::derive_state(&snap.tasks);
            if !matches!(snap.state, pipemill_core::status::JobState::Running) {
                snap.current = None;
                snap.current_stage = None;
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemill_core::status::{JobState, TaskState};
    use pipemill_core::JobId;

    fn new_store(dir: &Path) -> StatusStore {
        let snapshot = JobSnapshot::new(
            JobId::parse("j_abc123").unwrap(),
            "test",
            "default",
            &["a".to_string(), "b".to_string()],
        );
        StatusStore::create(dir.join("tasks-status.json"), snapshot).unwrap()
    }

    #[tokio::test]
    async fn update_persists_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());

        store
            .update(|snap| {
                snap.tasks.get_mut("a").unwrap().state = TaskState::Running;
                snap.state = JobState::Running;
                snap.current = Some("a".to_string());
            })
            .await
            .unwrap();

        let reloaded = StatusStore::load(dir.path().join("tasks-status.json")).unwrap();
        let snap = reloaded.snapshot().await;
        assert_eq!(snap.state, JobState::Running);
        assert_eq!(snap.current.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn invariant_violation_aborts_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());
        let before = store.snapshot().await;

        let err = store
            .update(|snap| {
                // complete without all tasks done
                snap.state = JobState::Complete;
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));

        // In-memory and on-disk state are both unchanged.
        let after = store.snapshot().await;
        assert_eq!(after.state, before.state);
        let reloaded = StatusStore::load(dir.path().join("tasks-status.json")).unwrap();
        assert_eq!(reloaded.snapshot().await.state, before.state);
    }

    #[tokio::test]
    async fn last_updated_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());

        let mut previous = store.snapshot().await.last_updated;
        for _ in 0..5 {
            let snap = store.update(|_| {}).await.unwrap();
            assert!(snap.last_updated >= previous);
            previous = snap.last_updated;
        }
    }

    #[tokio::test]
    async fn reset_single_task_rederives_job_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());

        store
            .update(|snap| {
                let task = snap.tasks.get_mut("a").unwrap();
                task.state = TaskState::Failed;
                task.attempts = 2;
                task.error = Some(pipemill_core::status::ErrorRecord::new("boom"));
                snap.state = JobState::Failed;
            })
            .await
            .unwrap();

        let snap = store.reset_single_task("a", true).await.unwrap();
        let task = &snap.tasks["a"];
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.error.is_none());
        assert_eq!(snap.state, JobState::Pending);
        assert!(snap.current.is_none());
    }
}
