//! The single source of data-directory paths.
//!
//! All filesystem-touching code builds paths through [`PathResolver`];
//! direct string concatenation against the data root is forbidden.

use std::path::{Path, PathBuf};

use pipemill_core::status::FileKind;
use pipemill_core::JobId;

/// Name of the authoritative status document inside a job directory.
pub const STATUS_FILE: &str = "tasks-status.json";
/// Name of the seed document inside a job directory.
pub const SEED_FILE: &str = "seed.json";

/// Resolves every path under the data root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn data_root(&self) -> &Path {
        &self.root
    }

    // -- pipeline-config -----------------------------------------------------

    pub fn pipeline_config(&self) -> PathBuf {
        self.root.join("pipeline-config")
    }

    pub fn pipeline_dir(&self, slug: &str) -> PathBuf {
        self.pipeline_config().join(slug)
    }

    pub fn pipeline_spec(&self, slug: &str) -> PathBuf {
        self.pipeline_dir(slug).join("pipeline.json")
    }

    // -- pipeline-data phases ------------------------------------------------

    pub fn pending_root(&self) -> PathBuf {
        self.root.join("pipeline-data").join("pending")
    }

    pub fn current_root(&self) -> PathBuf {
        self.root.join("pipeline-data").join("current")
    }

    pub fn complete_root(&self) -> PathBuf {
        self.root.join("pipeline-data").join("complete")
    }

    pub fn rejected_root(&self) -> PathBuf {
        self.root.join("pipeline-data").join("rejected")
    }

    pub fn pending_seed(&self, job_id: &JobId) -> PathBuf {
        self.pending_root().join(format!("{job_id}-seed.json"))
    }

    pub fn current(&self, job_id: &JobId) -> PathBuf {
        self.current_root().join(job_id.as_str())
    }

    pub fn complete(&self, job_id: &JobId) -> PathBuf {
        self.complete_root().join(job_id.as_str())
    }

    // -- inside a job directory ----------------------------------------------

    pub fn seed_in(&self, job_dir: &Path) -> PathBuf {
        job_dir.join(SEED_FILE)
    }

    pub fn status_in(&self, job_dir: &Path) -> PathBuf {
        job_dir.join(STATUS_FILE)
    }

    /// Per-task scratch directory.
    pub fn task_dir(&self, job_dir: &Path, task_id: &str) -> PathBuf {
        job_dir.join("tasks").join(task_id)
    }

    /// One of `files/{artifacts,logs,tmp}` inside a job directory. This is
    /// the jail root for user-supplied filenames of that kind.
    pub fn files_dir(&self, job_dir: &Path, kind: FileKind) -> PathBuf {
        job_dir.join("files").join(kind.as_str())
    }
}
