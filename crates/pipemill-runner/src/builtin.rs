//! The built-in generic task.
//!
//! Registered as the fallback for every task id that has no dedicated
//! stage set: a template -> inference -> defensive-parse pipeline whose
//! `integration` stage writes the result artifact. Stages not listed here
//! (preProcessing, validateQuality, critique, refine, finalValidation)
//! pass their input through unchanged.

use serde_json::{json, Value};

use pipemill_core::task::{StageContext, StageOutcome, TaskDef, TaskRegistry};
use pipemill_core::{Error, Result, Stage};

/// Registry with the generic task as the fallback for every task id.
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.set_fallback(generic_task());
    registry
}

/// The generic task definition.
pub fn generic_task() -> TaskDef {
    TaskDef::new()
        .stage(Stage::Ingestion, ingestion)
        .stage(Stage::PromptTemplating, prompt_templating)
        .stage(Stage::Inference, inference)
        .stage(Stage::Parsing, parsing)
        .stage(Stage::ValidateStructure, validate_structure)
        .stage(Stage::Integration, integration)
}

async fn ingestion(ctx: StageContext) -> Result<StageOutcome> {
    Ok(StageOutcome::output(ctx.seed.data.clone()))
}

/// Render the seed's `template` (default `{input}`) against the current
/// output and the seed's string fields.
async fn prompt_templating(ctx: StageContext) -> Result<StageOutcome> {
    let template = ctx
        .seed
        .data
        .get("template")
        .and_then(Value::as_str)
        .unwrap_or("{input}");

    let input = match &ctx.output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut prompt = template.replace("{input}", &input);
    if let Some(fields) = ctx.seed.data.as_object() {
        for (key, value) in fields {
            if let Value::String(s) = value {
                prompt = prompt.replace(&format!("{{{key}}}"), s);
            }
        }
    }

    Ok(StageOutcome::output(json!({ "prompt": prompt })))
}

async fn inference(ctx: StageContext) -> Result<StageOutcome> {
    let prompt = ctx
        .output
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let response = ctx.llm.complete(&prompt).await?;
    Ok(StageOutcome::output(json!({ "text": response.text })))
}

/// Defensive parse: prefer embedded JSON, fall back to wrapping the raw
/// text so downstream stages always see an object.
async fn parsing(ctx: StageContext) -> Result<StageOutcome> {
    let text = ctx
        .output
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let parsed = extract_json(text).unwrap_or_else(|| json!({ "text": text }));
    Ok(StageOutcome::output(parsed))
}

async fn validate_structure(ctx: StageContext) -> Result<StageOutcome> {
    if ctx.output.is_null() {
        return Err(Error::stage(
            Stage::ValidateStructure.name(),
            "stage output is null",
        ));
    }
    Ok(StageOutcome::output(ctx.output))
}

/// Write the final artifact and a completion log line; the output passes
/// through as the task's contribution to `previousTaskOutputs`.
async fn integration(ctx: StageContext) -> Result<StageOutcome> {
    let artifact = format!("{}-result.json", ctx.meta.task_id);
    let bytes = serde_json::to_vec_pretty(&ctx.output)
        .map_err(|e| Error::stage(Stage::Integration.name(), e.to_string()))?;
    ctx.io.write_artifact(&artifact, &bytes).await?;
    ctx.io
        .append_log(&format!(
            "task {} integrated on attempt {}",
            ctx.meta.task_id, ctx.meta.attempt
        ))
        .await?;
    Ok(StageOutcome::output(ctx.output))
}

/// Pull the first JSON object or array out of a model response, tolerating
/// surrounding prose and markdown fences.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Markdown code fence
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str(rest[..end].trim()) {
                return Some(value);
            }
        }
    }

    // Bracket match
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}
