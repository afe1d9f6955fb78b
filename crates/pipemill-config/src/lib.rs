//! Configuration loading for pipemill.
//!
//! This crate handles:
//! - Pipeline definitions (`pipeline-config/<slug>/pipeline.json`)
//! - The pipeline registry (`pipeline-config/registry.json`)
//! - Environment variables (`PO_ROOT`, `PO_PIPELINE_SLUG`, ...)

pub mod env;
pub mod error;
pub mod pipeline;
pub mod registry;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{PipelineSpec, TaskConfig, DEFAULT_MAX_REFINEMENTS};
pub use registry::{PipelineRegistry, DEFAULT_PIPELINE};
