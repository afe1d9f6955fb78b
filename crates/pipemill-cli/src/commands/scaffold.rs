//! Filesystem scaffolding: `init`, `add-pipeline`, `add-pipeline-task`.

use anyhow::{bail, Context};
use std::path::Path;

use pipemill_config::{PipelineRegistry, PipelineSpec, DEFAULT_PIPELINE};
use pipemill_store::PathResolver;

/// Create the data directory layout with a default single-task pipeline.
pub fn init(root: &Path) -> anyhow::Result<()> {
    let resolver = PathResolver::new(root);
    for dir in [
        resolver.pending_root(),
        resolver.current_root(),
        resolver.complete_root(),
        resolver.rejected_root(),
        resolver.pipeline_config(),
    ] {
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let spec_path = resolver.pipeline_spec(DEFAULT_PIPELINE);
    if !spec_path.exists() {
        write_spec(&spec_path, &PipelineSpec::scaffold(DEFAULT_PIPELINE))?;
        let mut registry = PipelineRegistry::load(&resolver.pipeline_config())?;
        registry.register(DEFAULT_PIPELINE)?;
    }

    println!("initialized data root at {}", resolver.data_root().display());
    Ok(())
}

/// Scaffold a fresh pipeline and register it.
pub fn add_pipeline(root: &Path, slug: &str) -> anyhow::Result<()> {
    let resolver = PathResolver::new(root);
    let spec_path = resolver.pipeline_spec(slug);
    if spec_path.exists() {
        bail!("pipeline {slug:?} already exists at {}", spec_path.display());
    }

    write_spec(&spec_path, &PipelineSpec::scaffold(slug))?;
    let mut registry = PipelineRegistry::load(&resolver.pipeline_config())?;
    registry.register(slug)?;

    println!("created pipeline {slug} at {}", spec_path.display());
    Ok(())
}

/// Append a task id (and a config stub) to an existing pipeline.
pub fn add_pipeline_task(root: &Path, pipeline_slug: &str, task_slug: &str) -> anyhow::Result<()> {
    let resolver = PathResolver::new(root);
    let spec_path = resolver.pipeline_spec(pipeline_slug);
    let mut spec = PipelineSpec::load(&spec_path)
        .with_context(|| format!("load pipeline {pipeline_slug:?}"))?;

    if spec.tasks.iter().any(|t| t == task_slug) {
        bail!("task {task_slug:?} already exists in pipeline {pipeline_slug:?}");
    }
    spec.tasks.push(task_slug.to_string());
    spec.task_config
        .entry(task_slug.to_string())
        .or_default();

    write_spec(&spec_path, &spec)?;
    println!("added task {task_slug} to pipeline {pipeline_slug}");
    Ok(())
}

fn write_spec(path: &Path, spec: &PipelineSpec) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(spec)?;
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
