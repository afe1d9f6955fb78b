//! Environment variable configuration.
//!
//! All knobs are read through this module so the variable names live in
//! one place.

use std::path::PathBuf;

use crate::{ConfigError, ConfigResult};

pub const PO_ROOT: &str = "PO_ROOT";
pub const PO_PIPELINE_SLUG: &str = "PO_PIPELINE_SLUG";
pub const PO_DEFAULT_PROVIDER: &str = "PO_DEFAULT_PROVIDER";
pub const PORT: &str = "PORT";
pub const PO_UI_PORT: &str = "PO_UI_PORT";

const DEFAULT_PORT: u16 = 3000;

/// Data root, if configured.
pub fn data_root() -> Option<PathBuf> {
    std::env::var_os(PO_ROOT).map(PathBuf::from)
}

/// Data root, required. Missing `PO_ROOT` is a fatal startup error for the
/// worker and for `start` without `--root`.
pub fn require_data_root() -> ConfigResult<PathBuf> {
    data_root().ok_or(ConfigError::MissingEnv(PO_ROOT))
}

/// Active pipeline slug override.
pub fn pipeline_slug() -> Option<String> {
    std::env::var(PO_PIPELINE_SLUG).ok().filter(|s| !s.is_empty())
}

/// Default inference provider label.
pub fn default_provider() -> Option<String> {
    std::env::var(PO_DEFAULT_PROVIDER)
        .ok()
        .filter(|s| !s.is_empty())
}

/// HTTP port: `PORT` wins, then `PO_UI_PORT`, then 3000.
pub fn ui_port() -> u16 {
    for var in [PORT, PO_UI_PORT] {
        if let Ok(value) = std::env::var(var) {
            if let Ok(port) = value.parse() {
                return port;
            }
        }
    }
    DEFAULT_PORT
}
