//! Pipeline definition parsing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::{ConfigError, ConfigResult};

/// Refinement-loop bound applied when a task config does not override it.
pub const DEFAULT_MAX_REFINEMENTS: u32 = 3;

/// A pipeline definition: the ordered task list plus per-task config.
///
/// Loaded once per job from `pipeline-config/<slug>/pipeline.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Task ids, executed strictly in this order.
    pub tasks: Vec<String>,
    #[serde(default)]
    pub task_config: HashMap<String, TaskConfig>,
}

/// Per-task configuration knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_refinements: Option<u32>,
    /// Free-form task parameters, handed through to stage functions.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PipelineSpec {
    /// Load and validate a pipeline definition from disk.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let bytes = std::fs::read(path)?;
        let spec: PipelineSpec =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.tasks.is_empty() {
            return Err(ConfigError::MissingField("tasks".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "tasks".to_string(),
                    message: "empty task id".to_string(),
                });
            }
            if !seen.insert(task.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "tasks".to_string(),
                    message: format!("duplicate task id {task:?}"),
                });
            }
        }
        Ok(())
    }

    /// Refinement bound for a task, falling back to the default.
    pub fn max_refinements(&self, task_id: &str) -> u32 {
        self.task_config
            .get(task_id)
            .and_then(|c| c.max_refinements)
            .unwrap_or(DEFAULT_MAX_REFINEMENTS)
    }

    /// A minimal single-task pipeline, used by scaffolding.
    pub fn scaffold(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some("1.0.0".to_string()),
            tasks: vec!["generate".to_string()],
            task_config: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_spec(json: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_a_pipeline() {
        let (_dir, path) = write_spec(
            r#"{
                "name": "content-gen",
                "version": "2.1.0",
                "tasks": ["outline", "draft"],
                "taskConfig": {"draft": {"maxRefinements": 5, "temperature": 0.2}}
            }"#,
        );
        let spec = PipelineSpec::load(&path).unwrap();
        assert_eq!(spec.name, "content-gen");
        assert_eq!(spec.tasks, vec!["outline", "draft"]);
        assert_eq!(spec.max_refinements("draft"), 5);
        assert_eq!(spec.max_refinements("outline"), DEFAULT_MAX_REFINEMENTS);
        assert_eq!(
            spec.task_config["draft"].extra["temperature"],
            serde_json::json!(0.2)
        );
    }

    #[test]
    fn rejects_empty_task_list() {
        let (_dir, path) = write_spec(r#"{"name": "p", "tasks": []}"#);
        assert!(matches!(
            PipelineSpec::load(&path),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn rejects_duplicate_tasks() {
        let (_dir, path) = write_spec(r#"{"name": "p", "tasks": ["a", "a"]}"#);
        assert!(matches!(
            PipelineSpec::load(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let (_dir, path) = write_spec("{broken");
        let err = PipelineSpec::load(&path).unwrap_err();
        assert!(err.to_string().contains("pipeline.json"), "{err}");
    }
}
