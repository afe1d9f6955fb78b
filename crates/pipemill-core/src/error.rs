//! Error types for pipemill.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller input failed validation (seed document, HTTP params).
    #[error("{0}")]
    Validation(String),

    /// Job, task, or file missing after probing both phase directories.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path-jail violation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Recoverable I/O fault (watcher glitch, broadcast write).
    #[error("transient io: {0}")]
    TransientIo(String),

    /// Unrecoverable I/O fault (rename or fsync failure on a status write).
    #[error("fatal io: {0}")]
    FatalIo(String),

    /// A user stage function returned an error or panicked.
    #[error("stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// A snapshot mutation would break the status-model invariants.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::FatalIo(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
