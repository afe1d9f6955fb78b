//! notify-based directory watching, bridged into tokio.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Message from the watcher callback thread.
#[derive(Debug)]
pub enum WatchSignal {
    /// A file was created or modified at this path.
    Changed(PathBuf),
    /// The watcher itself failed and should be recreated.
    Failed(String),
}

/// Initial delay before recreating a failed watcher.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
/// Backoff cap.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Double a backoff delay, capped.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}

/// Create a watcher on `dir`, forwarding create/modify paths into `tx`.
///
/// The returned guard must be kept alive for the watch to stay active.
/// The callback runs on notify's thread, so it bridges with
/// `blocking_send`; a full channel drops the oldest signals, which is safe
/// because consumers re-read state from disk.
pub fn watch_dir(
    dir: &Path,
    recursive: bool,
    tx: mpsc::Sender<WatchSignal>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.blocking_send(WatchSignal::Changed(path));
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(WatchSignal::Failed(e.to_string()));
                }
            }
        })?;
    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(dir, mode)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = BACKOFF_INITIAL;
        for _ in 0..10 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, BACKOFF_MAX);
        assert_eq!(next_backoff(BACKOFF_MAX), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn reports_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _guard = watch_dir(dir.path(), false, tx).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("probe.json"), b"{}").unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report within 5s")
            .expect("channel open");
        match signal {
            WatchSignal::Changed(path) => {
                assert!(path.ends_with("probe.json"), "{path:?}")
            }
            WatchSignal::Failed(e) => panic!("unexpected watcher failure: {e}"),
        }
    }
}
