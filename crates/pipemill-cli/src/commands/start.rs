//! `pipemill start` — orchestrator plus HTTP server in one process.

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use pipemill_api::detector::ChangeDetector;
use pipemill_api::{routes, AppState, Enhancer};
use pipemill_orchestrator::{Orchestrator, ProcessSpawner};
use pipemill_store::PathResolver;

pub async fn start(root: PathBuf, port: u16) -> anyhow::Result<()> {
    super::init_tracing();

    let resolver = PathResolver::new(&root);
    anyhow::ensure!(
        resolver.data_root().exists(),
        "data root {} does not exist (run `pipemill init` first)",
        resolver.data_root().display()
    );

    let orchestrator = Arc::new(Orchestrator::new(
        resolver.clone(),
        Arc::new(ProcessSpawner::new(&root)),
    ));
    orchestrator.start().await?;

    let state = AppState::new(resolver.clone(), Some(orchestrator.clone()));

    // filesystem change -> debounced re-read -> SSE broadcast
    let enhancer = Arc::new(Enhancer::new(state.reader.clone(), state.hub.clone()));
    let (change_tx, mut change_rx) = mpsc::channel(256);
    let watch_tasks = ChangeDetector::new(resolver.clone()).start(change_tx);
    let feed_enhancer = enhancer.clone();
    let feed = tokio::spawn(async move {
        while let Some(event) = change_rx.recv().await {
            feed_enhancer.on_change(event);
        }
    });

    let app = routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, root = %resolver.data_root().display(), "pipemill serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    orchestrator.stop().await;
    enhancer.cleanup();
    feed.abort();
    for task in watch_tasks {
        task.abort();
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
