//! Filesystem storage for pipemill.
//!
//! Everything that touches the data directory goes through this crate:
//! - [`atomic`] — crash-safe file writes (temp sibling + fsync + rename)
//! - [`paths`] — the single source of data-directory paths
//! - [`jail`] — path-jail resolution for user-supplied filenames
//! - [`writer`] — the only component allowed to mutate `tasks-status.json`
//! - [`reader`] — phase-probing job reads
//! - [`transform`] — raw snapshot to canonical API payload
//! - [`files`] — scoped file handles for task stages
//! - [`promote`] — atomic phase moves (`current/` to `complete/`)

pub mod atomic;
pub mod files;
pub mod jail;
pub mod paths;
pub mod promote;
pub mod reader;
pub mod transform;
pub mod writer;

pub use files::JobFiles;
pub use paths::PathResolver;
pub use reader::{JobLocation, JobReader, RawJob};
pub use transform::JobSummary;
pub use writer::StatusStore;
