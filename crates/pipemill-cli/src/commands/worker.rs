//! `pipemill worker <jobId>` — the isolated per-job worker process.
//!
//! Spawned by the orchestrator with `PO_ROOT` in the environment. Exits 0
//! on completion, 1 on job failure, 130 after a graceful interrupt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use pipemill_config::env;
use pipemill_core::task::EchoInference;
use pipemill_core::JobId;
use pipemill_runner::{default_registry, PipelineRunner, RunOutcome};
use pipemill_store::PathResolver;

pub async fn worker(job_id: &str) -> anyhow::Result<()> {
    super::init_tracing();

    let root = env::require_data_root()?;
    let job_id = JobId::parse(job_id)?;
    let resolver = PathResolver::new(root);

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(shutdown.clone());

    let provider = env::default_provider().unwrap_or_else(|| "echo".to_string());
    let runner = PipelineRunner::new(
        resolver,
        Arc::new(default_registry()),
        Arc::new(EchoInference::new(provider)),
        shutdown,
        env::pipeline_slug(),
    );

    match runner.run(&job_id).await? {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed => {
            warn!(job_id = %job_id, "job failed");
            std::process::exit(1);
        }
        RunOutcome::Interrupted => {
            info!(job_id = %job_id, "interrupted, snapshot flushed");
            std::process::exit(130);
        }
    }
}

/// Flip the shutdown flag on SIGTERM/SIGINT; the runner flushes between
/// stage transitions and exits.
fn spawn_signal_listener(shutdown: Arc<AtomicBool>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("termination signal received");
        shutdown.store(true, Ordering::SeqCst);
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.store(true, Ordering::SeqCst);
        }
    });
}
