//! Seed dispatch and worker supervision.
//!
//! The dispatcher enforces at-most-one worker per job identity through two
//! exclusion tokens: the in-memory running map (within one orchestrator
//! lifetime) and the existence of `<current>/<jobId>/seed.json` (across
//! restarts). The seed move into `current/` is a same-filesystem atomic
//! rename.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use pipemill_config::{PipelineRegistry, DEFAULT_PIPELINE};
use pipemill_core::status::JobSnapshot;
use pipemill_core::{Error, JobId, Result, Seed};
use pipemill_store::writer::persist_snapshot;
use pipemill_store::{atomic, PathResolver};

use crate::watcher::{self, WatchSignal, BACKOFF_INITIAL};

static SEED_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_-]{6,30})-seed\.json$").expect("seed pattern"));

/// Grace window between the graceful and forceful termination signals.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A spawned worker: its pid (when it is a real process) and a future
/// resolving to the exit code.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub wait: BoxFuture<'static, std::io::Result<i32>>,
}

/// Boundary for launching workers, so supervision logic is testable
/// without real child processes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, job_id: &JobId) -> Result<SpawnedWorker>;
}

/// Spawns the `worker` subcommand of the current executable as an isolated
/// child process, handing it the job id and the data root.
pub struct ProcessSpawner {
    data_root: PathBuf,
}

impl ProcessSpawner {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, job_id: &JobId) -> Result<SpawnedWorker> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::FatalIo(format!("current executable: {e}")))?;
        let mut child = tokio::process::Command::new(exe)
            .arg("worker")
            .arg(job_id.as_str())
            .env(pipemill_config::env::PO_ROOT, &self.data_root)
            .spawn()
            .map_err(|e| Error::FatalIo(format!("spawn worker: {e}")))?;
        let pid = child.id();
        Ok(SpawnedWorker {
            pid,
            wait: Box::pin(async move {
                let status = child.wait().await?;
                Ok(status.code().unwrap_or(-1))
            }),
        })
    }
}

/// Diagnostic snapshot of the orchestrator, served by `/api/state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub watching: bool,
    pub active_workers: Vec<String>,
    pub data_root: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Watches `pending/`, promotes seeds, and supervises workers.
pub struct Orchestrator {
    resolver: PathResolver,
    spawner: Arc<dyn WorkerSpawner>,
    running: Mutex<HashMap<JobId, Option<u32>>>,
    watching: AtomicBool,
    shutdown: Notify,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(resolver: PathResolver, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            resolver,
            spawner,
            running: Mutex::new(HashMap::new()),
            watching: AtomicBool::new(false),
            shutdown: Notify::new(),
            started_at: Mutex::new(None),
        }
    }

    /// Begin watching the pending directory. Idempotent; fails only when
    /// the data root is unreachable.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.watching.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.resolver.data_root().exists() {
            self.watching.store(false, Ordering::SeqCst);
            return Err(Error::FatalIo(format!(
                "data root unreachable: {}",
                self.resolver.data_root().display()
            )));
        }
        for dir in [
            self.resolver.pending_root(),
            self.resolver.current_root(),
            self.resolver.complete_root(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        *self.started_at.lock().await = Some(Utc::now());

        self.report_leftover_jobs();

        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.watch_loop().await });
        info!(root = %self.resolver.data_root().display(), "orchestrator watching");
        Ok(())
    }

    /// Stop watching and terminate workers: graceful signal, a grace
    /// window, then force-kill survivors.
    pub async fn stop(&self) {
        if !self.watching.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let pids: Vec<(JobId, Option<u32>)> = self
            .running
            .lock()
            .await
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();
        for (job_id, pid) in &pids {
            info!(job_id = %job_id, ?pid, "requesting graceful worker shutdown");
            if let Some(pid) = pid {
                signal_pid(*pid, "-15");
            }
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.running.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let survivors: Vec<(JobId, Option<u32>)> = self
            .running
            .lock()
            .await
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();
        for (job_id, pid) in survivors {
            warn!(job_id = %job_id, ?pid, "worker outlived the grace window, force-killing");
            if let Some(pid) = pid {
                signal_pid(pid, "-9");
            }
        }
    }

    /// Diagnostic state for the HTTP surface.
    pub async fn state(&self) -> OrchestratorState {
        OrchestratorState {
            watching: self.watching.load(Ordering::SeqCst),
            active_workers: self
                .running
                .lock()
                .await
                .keys()
                .map(|id| id.to_string())
                .collect(),
            data_root: self.resolver.data_root().display().to_string(),
            started_at: *self.started_at.lock().await,
        }
    }

    /// No auto-resume on cold start: jobs left in `current/` need operator
    /// action, so name them at startup.
    fn report_leftover_jobs(&self) {
        let Ok(entries) = std::fs::read_dir(self.resolver.current_root()) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                warn!(
                    job_id = %name,
                    "job left in current/ from an earlier run; re-submit its seed to resume"
                );
            }
        }
    }

    async fn watch_loop(self: Arc<Self>) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if !self.watching.load(Ordering::SeqCst) {
                return;
            }
            let (tx, mut rx) = mpsc::channel(64);
            let guard = match watcher::watch_dir(&self.resolver.pending_root(), false, tx) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, delay = ?backoff, "pending watcher failed, recreating");
                    tokio::time::sleep(backoff).await;
                    backoff = watcher::next_backoff(backoff);
                    continue;
                }
            };
            backoff = BACKOFF_INITIAL;

            // Pick up seeds that were already waiting before the watch began.
            self.scan_pending().await;

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        return;
                    }
                    signal = rx.recv() => match signal {
                        Some(WatchSignal::Changed(path)) => self.on_seed_appeared(&path).await,
                        Some(WatchSignal::Failed(e)) => {
                            warn!(error = %e, "watcher error, recreating");
                            break;
                        }
                        None => break,
                    }
                }
            }
            drop(guard);
            tokio::time::sleep(backoff).await;
            backoff = watcher::next_backoff(backoff);
        }
    }

    async fn scan_pending(self: &Arc<Self>) {
        let Ok(entries) = std::fs::read_dir(self.resolver.pending_root()) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            self.on_seed_appeared(&entry.path()).await;
        }
    }

    /// The only mutating path: promote one pending seed and spawn its
    /// worker.
    pub async fn on_seed_appeared(self: &Arc<Self>, path: &Path) {
        if atomic::is_temp_path(path) {
            return;
        }
        let Some(job_id) = job_id_from_seed_path(path) else {
            if path.extension().is_some_and(|e| e == "json") {
                debug!(path = %path.display(), "ignoring file not matching the seed pattern");
            }
            return;
        };

        // Coalesced duplicate within this orchestrator lifetime.
        if self.running.lock().await.contains_key(&job_id) {
            return;
        }

        let dest_dir = self.resolver.current(&job_id);
        let dest = self.resolver.seed_in(&dest_dir);
        if dest.exists() {
            debug!(job_id = %job_id, "seed already claimed, dropping event");
            return;
        }
        if !path.exists() {
            return;
        }

        // Malformed seeds stay in pending for the operator.
        let seed = match std::fs::read(path).map_err(Error::from).and_then(|b| Seed::from_json(&b)) {
            Ok(seed) => seed,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "leaving malformed seed in place");
                return;
            }
        };

        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            warn!(job_id = %job_id, error = %e, "cannot create job directory");
            return;
        }
        if let Err(e) = std::fs::rename(path, &dest) {
            warn!(job_id = %job_id, error = %e, "seed move failed, leaving file in pending");
            return;
        }
        info!(job_id = %job_id, name = %seed.name, "seed promoted to current");

        if let Err(e) = self.ensure_job_layout(&job_id, &dest_dir, &seed) {
            warn!(job_id = %job_id, error = %e, "initial snapshot failed");
        }
        self.spawn_worker(job_id).await;
    }

    /// Ensure `tasks/` and an initial all-pending snapshot exist.
    fn ensure_job_layout(&self, job_id: &JobId, job_dir: &Path, seed: &Seed) -> Result<()> {
        std::fs::create_dir_all(job_dir.join("tasks"))?;
        let status_path = self.resolver.status_in(job_dir);
        if status_path.exists() {
            return Ok(());
        }

        let slug = seed
            .pipeline
            .clone()
            .unwrap_or_else(|| DEFAULT_PIPELINE.to_string());
        let tasks = PipelineRegistry::load(&self.resolver.pipeline_config())
            .and_then(|registry| registry.resolve(&slug))
            .map(|spec| spec.tasks)
            .unwrap_or_else(|e| {
                // The worker reconciles the task list at startup.
                warn!(job_id = %job_id, pipeline = %slug, error = %e, "pipeline config unavailable, seeding empty task list");
                Vec::new()
            });

        persist_snapshot(
            &status_path,
            &JobSnapshot::new(job_id.clone(), &seed.name, &slug, &tasks),
        )
    }

    async fn spawn_worker(self: &Arc<Self>, job_id: JobId) {
        let worker = match self.spawner.spawn(&job_id).await {
            Ok(worker) => worker,
            Err(e) => {
                // No retry; the snapshot stays pending for the operator.
                error!(job_id = %job_id, error = %e, "worker spawn failed");
                return;
            }
        };
        info!(job_id = %job_id, pid = ?worker.pid, "worker spawned");
        self.running
            .lock()
            .await
            .insert(job_id.clone(), worker.pid);

        // Supervise: deregister on exit, no automatic restart.
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match worker.wait.await {
                Ok(0) => info!(job_id = %job_id, "worker exited cleanly"),
                Ok(code) => warn!(job_id = %job_id, code, "worker exited with failure"),
                Err(e) => error!(job_id = %job_id, error = %e, "worker wait failed"),
            }
            orchestrator.running.lock().await.remove(&job_id);
        });
    }
}

/// Extract the job id from a `<jobId>-seed.json` filename.
pub fn job_id_from_seed_path(path: &Path) -> Option<JobId> {
    let name = path.file_name()?.to_str()?;
    let captures = SEED_NAME_RE.captures(name)?;
    JobId::parse(captures.get(1)?.as_str()).ok()
}

/// Signal a process by pid. Shells out to `kill` so no signal bindings are
/// needed; failures are logged and otherwise ignored.
fn signal_pid(pid: u32, signal: &str) {
    match std::process::Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pid, signal, %status, "kill reported failure"),
        Err(e) => warn!(pid, signal, error = %e, "kill could not run"),
    }
}
