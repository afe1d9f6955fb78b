//! Crash-safe file writes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write `bytes` to `path` atomically: write a unique temp sibling, fsync,
/// rename over the target, then fsync the containing directory.
///
/// Returns only after the durable rename. A partial write never appears at
/// the target path; the temp file is removed on failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("no parent directory: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(parent);
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Unique temp path next to the target: `<name>.tmp.<pid>.<rand>`.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..8];
    path.with_file_name(format!("{name}.tmp.{}.{rand}", std::process::id()))
}

/// Fsync a directory so a preceding rename is durable. Best-effort: some
/// platforms cannot open directories for sync.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// True for the temp siblings produced by [`write_atomic`], so watchers can
/// ignore them.
pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains(".tmp."))
        .unwrap_or(false)
}
