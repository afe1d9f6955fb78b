//! Change detection over the data roots.
//!
//! Watches `pending/`, `current/`, and `complete/`, classifies each
//! filesystem notification, and forwards `{jobId, phase, path}` events to
//! the enhancer. Dotfiles, temp siblings, and non-job files are ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use pipemill_core::JobId;
use pipemill_orchestrator::dispatcher::job_id_from_seed_path;
use pipemill_orchestrator::watcher::{self, WatchSignal, BACKOFF_INITIAL};
use pipemill_store::{atomic, PathResolver};

/// Which data root a change landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    Pending,
    Current,
    Complete,
}

/// A classified filesystem change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub job_id: Option<JobId>,
    pub phase: ChangePhase,
    pub path: PathBuf,
}

/// Classifies raw paths against the data layout.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    resolver: PathResolver,
}

impl ChangeDetector {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Map a changed path to an event, or `None` for ignorable noise.
    pub fn classify(&self, path: &Path) -> Option<ChangeEvent> {
        if atomic::is_temp_path(path) || has_hidden_component(path) {
            return None;
        }

        for (root, phase) in [
            (self.resolver.pending_root(), ChangePhase::Pending),
            (self.resolver.current_root(), ChangePhase::Current),
            (self.resolver.complete_root(), ChangePhase::Complete),
        ] {
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            let job_id = match phase {
                ChangePhase::Pending => job_id_from_seed_path(path),
                ChangePhase::Current | ChangePhase::Complete => relative
                    .components()
                    .next()
                    .and_then(|c| c.as_os_str().to_str())
                    .and_then(|name| JobId::parse(name).ok()),
            };
            return Some(ChangeEvent {
                job_id,
                phase,
                path: path.to_path_buf(),
            });
        }
        None
    }

    /// Start watching all three roots, forwarding classified events.
    /// Returns the watch tasks; aborting them stops the feed.
    pub fn start(self, tx: mpsc::Sender<ChangeEvent>) -> Vec<JoinHandle<()>> {
        let detector = Arc::new(self);
        [
            detector.resolver.pending_root(),
            detector.resolver.current_root(),
            detector.resolver.complete_root(),
        ]
        .into_iter()
        .map(|root| {
            let detector = detector.clone();
            let tx = tx.clone();
            tokio::spawn(async move { detector.watch_root(root, tx).await })
        })
        .collect()
    }

    async fn watch_root(&self, root: PathBuf, tx: mpsc::Sender<ChangeEvent>) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let _ = std::fs::create_dir_all(&root);
            let (signal_tx, mut signal_rx) = mpsc::channel(256);
            let guard = match watcher::watch_dir(&root, true, signal_tx) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "change watcher failed, recreating");
                    tokio::time::sleep(backoff).await;
                    backoff = watcher::next_backoff(backoff);
                    continue;
                }
            };
            backoff = BACKOFF_INITIAL;

            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    WatchSignal::Changed(path) => {
                        if let Some(event) = self.classify(&path) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    WatchSignal::Failed(e) => {
                        warn!(root = %root.display(), error = %e, "change watcher error, recreating");
                        break;
                    }
                }
            }
            drop(guard);
            tokio::time::sleep(backoff).await;
            backoff = watcher::next_backoff(backoff);
        }
    }
}

/// Any `.`-prefixed path component.
fn has_hidden_component(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| s.starts_with('.') && s != "." && s != "..")
    })
}
