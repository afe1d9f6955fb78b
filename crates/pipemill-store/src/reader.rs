//! The read path: phase-probing job reads.
//!
//! Readers parse the raw JSON document rather than the typed snapshot so
//! the transformer can normalize snapshots written by older or foreign
//! writers (unknown enum values and missing fields degrade gracefully
//! instead of failing the whole read).

use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

use pipemill_core::status::FileKind;
use pipemill_core::{Error, JobId, Result};

use crate::jail;
use crate::paths::PathResolver;

/// Which phase directory a job was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobLocation {
    Current,
    Complete,
}

impl JobLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLocation::Current => "current",
            JobLocation::Complete => "complete",
        }
    }
}

/// A raw snapshot read plus where it was found.
#[derive(Debug, Clone)]
pub struct RawJob {
    pub job_id: JobId,
    pub raw: serde_json::Value,
    pub location: JobLocation,
}

/// Read-only access to jobs across the `current` and `complete` phases.
#[derive(Debug, Clone)]
pub struct JobReader {
    resolver: PathResolver,
}

impl JobReader {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Resolve a job by probing `current/` then `complete/`.
    pub fn read_job(&self, job_id: &JobId) -> Result<RawJob> {
        for (dir, location) in [
            (self.resolver.current(job_id), JobLocation::Current),
            (self.resolver.complete(job_id), JobLocation::Complete),
        ] {
            let status_path = self.resolver.status_in(&dir);
            if !status_path.exists() {
                continue;
            }
            let bytes = std::fs::read(&status_path)
                .map_err(|e| Error::TransientIo(format!("read {}: {e}", status_path.display())))?;
            let raw = serde_json::from_slice(&bytes).map_err(|e| {
                Error::TransientIo(format!("parse {}: {e}", status_path.display()))
            })?;
            return Ok(RawJob {
                job_id: job_id.clone(),
                raw,
                location,
            });
        }
        Err(Error::not_found(format!("job {job_id}")))
    }

    /// All jobs across both phases. Unreadable entries are skipped with a
    /// warning rather than failing the listing.
    pub fn list_jobs(&self) -> Vec<RawJob> {
        let mut jobs = Vec::new();
        for (root, _location) in [
            (self.resolver.current_root(), JobLocation::Current),
            (self.resolver.complete_root(), JobLocation::Complete),
        ] {
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let Ok(job_id) = JobId::parse(&name) else {
                    continue;
                };
                match self.read_job(&job_id) {
                    // read_job probes current first, so a job present in both
                    // phases is reported once, from current.
                    Ok(job) => {
                        if !jobs.iter().any(|j: &RawJob| j.job_id == job.job_id) {
                            jobs.push(job);
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "skipping unreadable job");
                    }
                }
            }
        }
        jobs
    }

    /// Locate a task file inside the job's jail, probing `current/` then
    /// `complete/`. Jail violations surface before existence checks.
    pub fn find_file(
        &self,
        job_id: &JobId,
        kind: FileKind,
        filename: &str,
    ) -> Result<(PathBuf, JobLocation)> {
        for (dir, location) in [
            (self.resolver.current(job_id), JobLocation::Current),
            (self.resolver.complete(job_id), JobLocation::Complete),
        ] {
            let jail_root = self.resolver.files_dir(&dir, kind);
            let candidate = jail::resolve(&jail_root, filename)?;
            if candidate.is_file() {
                return Ok((candidate, location));
            }
        }
        Err(Error::not_found(format!(
            "{} file {filename:?} for job {job_id}",
            kind.as_str()
        )))
    }
}
