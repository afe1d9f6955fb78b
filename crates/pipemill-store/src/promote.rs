//! Atomic phase moves.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use pipemill_core::{Error, JobId, Result};

use crate::paths::PathResolver;

/// Move a finished job directory from `current/` to `complete/`.
///
/// Renames atomically when both phases live on the same filesystem;
/// otherwise copies into a staging directory, fsyncs, swaps it into place,
/// and removes the source. Idempotent: a destination that already exists is
/// treated as an earlier successful move.
pub fn promote(resolver: &PathResolver, job_id: &JobId) -> Result<PathBuf> {
    let src = resolver.current(job_id);
    let dst = resolver.complete(job_id);

    if dst.exists() {
        info!(job_id = %job_id, "destination already present, treating move as done");
        if src.exists() {
            warn!(job_id = %job_id, "source still present alongside destination, leaving for operator");
        }
        return Ok(dst);
    }
    if !src.exists() {
        return Err(Error::not_found(format!("job directory for {job_id}")));
    }
    fs::create_dir_all(resolver.complete_root())
        .map_err(|e| Error::FatalIo(format!("create complete root: {e}")))?;

    match fs::rename(&src, &dst) {
        Ok(()) => Ok(dst),
        Err(rename_err) => {
            // Likely a cross-device link; fall back to copy + swap.
            warn!(job_id = %job_id, error = %rename_err, "rename failed, copying tree");
            let staging = resolver
                .complete_root()
                .join(format!(".{}.staging", job_id.as_str()));
            let result = copy_then_swap(&src, &dst, &staging);
            if result.is_err() {
                let _ = fs::remove_dir_all(&staging);
            }
            result.map_err(|e| Error::FatalIo(format!("promote {job_id}: {e}")))?;
            Ok(dst)
        }
    }
}

fn copy_then_swap(src: &Path, dst: &Path, staging: &Path) -> io::Result<()> {
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    copy_tree(src, staging)?;
    fs::rename(staging, dst)?;
    fs::remove_dir_all(src)?;
    Ok(())
}

/// Recursive copy with per-file fsync so the swap lands durable content.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            File::open(&target)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_job() -> (tempfile::TempDir, PathResolver, JobId) {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let job_id = JobId::parse("j_abc123").unwrap();
        let job_dir = resolver.current(&job_id);
        fs::create_dir_all(job_dir.join("files/artifacts")).unwrap();
        fs::write(job_dir.join("seed.json"), b"{\"name\":\"x\"}").unwrap();
        fs::write(job_dir.join("files/artifacts/out.json"), b"{}").unwrap();
        (dir, resolver, job_id)
    }

    #[test]
    fn moves_the_whole_tree() {
        let (_dir, resolver, job_id) = seeded_job();
        let dst = promote(&resolver, &job_id).unwrap();

        assert!(!resolver.current(&job_id).exists());
        assert!(dst.join("seed.json").is_file());
        assert!(dst.join("files/artifacts/out.json").is_file());
    }

    #[test]
    fn second_invocation_is_a_no_op() {
        let (_dir, resolver, job_id) = seeded_job();
        promote(&resolver, &job_id).unwrap();
        let dst = promote(&resolver, &job_id).unwrap();
        assert!(dst.join("seed.json").is_file());
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let ghost = JobId::parse("j_000000").unwrap();
        assert!(matches!(
            promote(&resolver, &ghost),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn copy_tree_preserves_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/deep.txt"), b"deep").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a/b/deep.txt")).unwrap(), b"deep");
    }
}
