//! Scoped file access for task stages.
//!
//! A [`JobFiles`] handle grants one task write access to the job's
//! `files/{artifacts,logs,tmp}/` tree and nothing else. Written names are
//! recorded so the runner can register them in the snapshot after each
//! stage; unregistered files are invisible to the UI.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

use pipemill_core::status::{FileKind, FileSets};
use pipemill_core::task::StageIo;
use pipemill_core::{Error, Result};

use crate::jail;
use crate::paths::PathResolver;

pub struct JobFiles {
    artifacts: PathBuf,
    logs: PathBuf,
    tmp: PathBuf,
    task_log: String,
    registered: Mutex<FileSets>,
}

impl JobFiles {
    /// Create the handle for one task, ensuring the files tree exists.
    pub fn new(resolver: &PathResolver, job_dir: &std::path::Path, task_id: &str) -> Result<Self> {
        let artifacts = resolver.files_dir(job_dir, FileKind::Artifacts);
        let logs = resolver.files_dir(job_dir, FileKind::Logs);
        let tmp = resolver.files_dir(job_dir, FileKind::Tmp);
        for dir in [&artifacts, &logs, &tmp] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            artifacts,
            logs,
            tmp,
            task_log: format!("{task_id}.log"),
            registered: Mutex::new(FileSets::default()),
        })
    }

    /// Drain the names registered since the last call.
    pub fn take_registered(&self) -> FileSets {
        std::mem::take(&mut self.registered.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn write(&self, kind: FileKind, name: &str, bytes: &[u8]) -> Result<()> {
        let root = match kind {
            FileKind::Artifacts => &self.artifacts,
            FileKind::Logs => &self.logs,
            FileKind::Tmp => &self.tmp,
        };
        let path = jail::resolve(root, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::FatalIo(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::FatalIo(format!("write {}: {e}", path.display())))?;
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(kind, &normalized_name(root, &path, name));
        Ok(())
    }
}

/// Registered names are jail-relative, with `.`/`..` segments resolved.
fn normalized_name(root: &std::path::Path, resolved: &std::path::Path, fallback: &str) -> String {
    resolved
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| fallback.to_string())
}

#[async_trait]
impl StageIo for JobFiles {
    async fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.write(FileKind::Artifacts, name, bytes).await
    }

    async fn write_log(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.write(FileKind::Logs, name, bytes).await
    }

    async fn write_tmp(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.write(FileKind::Tmp, name, bytes).await
    }

    async fn append_log(&self, line: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let path = self.logs.join(&self.task_log);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::FatalIo(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::FatalIo(format!("append {}: {e}", path.display())))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| Error::FatalIo(format!("append {}: {e}", path.display())))?;
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(FileKind::Logs, &self.task_log);
        Ok(())
    }
}
