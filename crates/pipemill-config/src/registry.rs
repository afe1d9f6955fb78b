//! The pipeline registry (`pipeline-config/registry.json`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{ConfigError, ConfigResult, PipelineSpec};

/// Slug of the pipeline used when a seed names none.
pub const DEFAULT_PIPELINE: &str = "default";

/// One registry entry, pointing at a pipeline's config file relative to the
/// `pipeline-config/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub config: PathBuf,
}

/// Read-mostly map of pipeline slugs to their definitions.
///
/// A missing `registry.json` is not an error: the registry falls back to a
/// single conventional entry, `<slug>/pipeline.json` per slug.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    config_dir: PathBuf,
    entries: HashMap<String, RegistryEntry>,
}

impl PipelineRegistry {
    /// Load the registry from `<configDir>/registry.json`.
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join("registry.json");
        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            debug!(path = %path.display(), "no registry.json, using conventional layout");
            HashMap::new()
        };
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            entries,
        })
    }

    /// Path of the pipeline definition for a slug.
    pub fn spec_path(&self, slug: &str) -> PathBuf {
        match self.entries.get(slug) {
            Some(entry) => self.config_dir.join(&entry.config),
            None => self.config_dir.join(slug).join("pipeline.json"),
        }
    }

    /// Resolve and load the pipeline definition for a slug.
    pub fn resolve(&self, slug: &str) -> ConfigResult<PipelineSpec> {
        let path = self.spec_path(slug);
        if !path.exists() {
            return Err(ConfigError::UnknownPipeline(slug.to_string()));
        }
        PipelineSpec::load(&path)
    }

    /// Register a slug, writing `registry.json` back to disk.
    pub fn register(&mut self, slug: &str) -> ConfigResult<()> {
        self.entries.insert(
            slug.to_string(),
            RegistryEntry {
                config: PathBuf::from(slug).join("pipeline.json"),
            },
        );
        let path = self.config_dir.join("registry.json");
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(|source| {
            ConfigError::Parse {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(&path, bytes)?;
        Ok(())
    }
}
