//! The enhancer: per-job debounce between the change detector and the hub.
//!
//! Bursts of filesystem notifications collapse into one fresh read per job
//! per trailing window. A broadcast payload is always a fresh read of the
//! current snapshot; read failures suppress the broadcast so no stale
//! payload reaches the wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use pipemill_core::{Error, JobId};
use pipemill_store::{transform, JobReader};

use crate::detector::ChangeEvent;
use crate::sse::SseHub;

/// Trailing debounce window per job.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

pub struct Enhancer {
    reader: Arc<JobReader>,
    hub: Arc<SseHub>,
    debounce: Duration,
    timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    /// Jobs that have produced at least one successful read (drives
    /// `job:created` vs `job:updated`).
    seen: Mutex<HashSet<JobId>>,
    last_status: Mutex<HashMap<JobId, String>>,
}

impl Enhancer {
    pub fn new(reader: Arc<JobReader>, hub: Arc<SseHub>) -> Self {
        Self::with_debounce(reader, hub, DEBOUNCE)
    }

    pub fn with_debounce(reader: Arc<JobReader>, hub: Arc<SseHub>, debounce: Duration) -> Self {
        Self {
            reader,
            hub,
            debounce,
            timers: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            last_status: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one detector event in: broadcast the coarse notification
    /// immediately, then (re)arm the job's debounce timer.
    pub fn on_change(self: &Arc<Self>, event: ChangeEvent) {
        self.hub.state_change(&event.path, event.job_id.as_ref());

        let Some(job_id) = event.job_id else {
            return;
        };

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timers.remove(&job_id) {
            previous.abort();
        }
        let enhancer = self.clone();
        let timer_job = job_id.clone();
        timers.insert(
            job_id,
            tokio::spawn(async move {
                tokio::time::sleep(enhancer.debounce).await;
                enhancer
                    .timers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&timer_job);
                enhancer.refresh(&timer_job).await;
            }),
        );
    }

    /// Re-read the job and broadcast the canonical payload.
    pub async fn refresh(&self, job_id: &JobId) {
        match self.reader.read_job(job_id) {
            Ok(raw) => {
                let summary = transform::summarize(&raw);
                let first_read = self
                    .seen
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(job_id.clone());
                if first_read {
                    self.hub.job_created(&summary);
                } else {
                    self.hub.job_updated(&summary);
                }

                let status = summary.status.as_str().to_string();
                let previous = self
                    .last_status
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(job_id.clone(), status.clone());
                if previous.as_deref() != Some(status.as_str()) {
                    self.hub.status_changed(job_id, &status);
                }
            }
            Err(Error::NotFound(_)) => {
                let was_seen = self
                    .seen
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(job_id);
                if was_seen {
                    self.last_status
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(job_id);
                    self.hub.job_removed(job_id);
                }
            }
            Err(e) => {
                // No stale payloads on the wire.
                debug!(job_id = %job_id, error = %e, "read failed, suppressing broadcast");
            }
        }
    }

    /// Cancel every pending debounce timer. Called on shutdown.
    pub fn cleanup(&self) {
        for (_, timer) in self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ChangePhase;
    use pipemill_core::status::JobSnapshot;
    use pipemill_store::writer::persist_snapshot;
    use pipemill_store::PathResolver;

    struct Fixture {
        _dir: tempfile::TempDir,
        resolver: PathResolver,
        enhancer: Arc<Enhancer>,
        hub: Arc<SseHub>,
        job_id: JobId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let hub = Arc::new(SseHub::new());
        let reader = Arc::new(JobReader::new(resolver.clone()));
        let enhancer = Arc::new(Enhancer::with_debounce(
            reader,
            hub.clone(),
            Duration::from_millis(20),
        ));
        Fixture {
            _dir: dir,
            resolver,
            enhancer,
            hub,
            job_id: JobId::parse("j_abc123").unwrap(),
        }
    }

    fn write_job(fx: &Fixture) {
        let snapshot =
            JobSnapshot::new(fx.job_id.clone(), "test", "default", &["a".to_string()]);
        persist_snapshot(
            &fx.resolver.status_in(&fx.resolver.current(&fx.job_id)),
            &snapshot,
        )
        .unwrap();
    }

    fn change(fx: &Fixture) -> ChangeEvent {
        ChangeEvent {
            job_id: Some(fx.job_id.clone()),
            phase: ChangePhase::Current,
            path: fx.resolver.status_in(&fx.resolver.current(&fx.job_id)),
        }
    }

    async fn next_named(
        rx: &mut tokio::sync::broadcast::Receiver<crate::sse::HubEvent>,
        name: &str,
    ) -> crate::sse::HubEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event within 2s")
                .expect("channel open");
            if event.name == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_broadcast() {
        let fx = fixture();
        write_job(&fx);
        let mut rx = fx.hub.subscribe();

        for _ in 0..5 {
            fx.enhancer.on_change(change(&fx));
        }

        let created = next_named(&mut rx, "job:created").await;
        assert_eq!(created.payload["id"], "j_abc123");
        // exactly one job:* broadcast for the burst; the status event follows
        let status = next_named(&mut rx, "status:changed").await;
        assert_eq!(status.payload["status"], "pending");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            rx.try_recv().is_err(),
            "burst should produce a single debounced read"
        );
    }

    #[tokio::test]
    async fn second_window_broadcasts_updated() {
        let fx = fixture();
        write_job(&fx);
        let mut rx = fx.hub.subscribe();

        fx.enhancer.on_change(change(&fx));
        next_named(&mut rx, "job:created").await;

        fx.enhancer.on_change(change(&fx));
        let updated = next_named(&mut rx, "job:updated").await;
        assert_eq!(updated.payload["id"], "j_abc123");
    }

    #[tokio::test]
    async fn read_failure_suppresses_broadcast_and_removal_is_reported() {
        let fx = fixture();
        let mut rx = fx.hub.subscribe();

        // Never-seen job that does not exist: only the coarse event goes out.
        fx.enhancer.on_change(change(&fx));
        let coarse = next_named(&mut rx, "state:change").await;
        assert!(coarse.payload["path"].as_str().unwrap().contains("j_abc123"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        // Seen job that disappears: job:removed.
        write_job(&fx);
        fx.enhancer.on_change(change(&fx));
        next_named(&mut rx, "job:created").await;

        std::fs::remove_dir_all(fx.resolver.current(&fx.job_id)).unwrap();
        fx.enhancer.on_change(change(&fx));
        let removed = next_named(&mut rx, "job:removed").await;
        assert_eq!(removed.payload["jobId"], "j_abc123");
    }

    #[tokio::test]
    async fn cleanup_cancels_pending_timers() {
        let fx = fixture();
        write_job(&fx);
        let mut rx = fx.hub.subscribe();

        fx.enhancer.on_change(change(&fx));
        fx.enhancer.cleanup();

        // the coarse notification went out, the debounced read never fires
        next_named(&mut rx, "state:change").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
