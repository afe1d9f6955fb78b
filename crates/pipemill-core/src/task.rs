//! The stage interface, task registry, and collaborator traits.
//!
//! Task bodies are user-defined stage functions registered at compile time.
//! The runner resolves each task id against a [`TaskRegistry`]; stages with
//! no registered implementation pass the previous output through unchanged.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::status::TokenUsage;
use crate::{JobId, Result, Seed, Stage};

/// Reserved flag raised by `validateQuality` to request a refinement pass.
pub const FLAG_REFINEMENT_NEEDED: &str = "refinementNeeded";
/// Reserved flag recording a soft validation failure.
pub const FLAG_VALIDATION_FAILED: &str = "validationFailed";

/// Value returned by a stage function.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// Becomes the input to the next stage.
    pub output: Value,
    /// Merged into the task-scoped flag bag, visible to later stages.
    pub flags: Map<String, Value>,
}

impl StageOutcome {
    pub fn output(output: Value) -> Self {
        Self {
            output,
            flags: Map::new(),
        }
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }
}

/// Identity of the stage invocation, handed to stage functions.
#[derive(Debug, Clone)]
pub struct StageMeta {
    pub job_id: JobId,
    pub task_id: String,
    pub stage: Stage,
    pub attempt: u32,
}

/// Context passed to every stage function.
pub struct StageContext {
    /// The immutable seed.
    pub seed: Arc<Seed>,
    /// Prior stage outputs within the current task, keyed by stage name,
    /// plus `previousTaskOutputs` with earlier tasks' final outputs.
    pub data: Map<String, Value>,
    /// The stage just executed; `None` means the input is the seed itself.
    pub previous_stage: Option<Stage>,
    /// Output of the previous stage (the seed data for `ingestion`).
    pub output: Value,
    /// Task-local flag bag.
    pub flags: Map<String, Value>,
    /// Scoped file handle for the job's `files/{artifacts,logs,tmp}/` tree.
    pub io: Arc<dyn StageIo>,
    /// Opaque inference callable.
    pub llm: Arc<dyn Inference>,
    pub meta: StageMeta,
}

impl StageContext {
    /// Check whether a flag is currently set to `true`.
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// An async stage function: context in, `{output, flags}` or error out.
pub type StageFn = Arc<dyn Fn(StageContext) -> BoxFuture<'static, Result<StageOutcome>> + Send + Sync>;

/// Stage implementations for one task id.
#[derive(Clone, Default)]
pub struct TaskDef {
    stages: HashMap<Stage, StageFn>,
}

impl TaskDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation for one stage.
    pub fn stage<F, Fut>(mut self, stage: Stage, f: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StageOutcome>> + Send + 'static,
    {
        let func: StageFn = Arc::new(move |ctx| Box::pin(f(ctx)));
        self.stages.insert(stage, func);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&StageFn> {
        self.stages.get(&stage)
    }
}

/// Compile-time registry mapping task ids to their stage implementations.
///
/// Unknown task ids resolve to the fallback definition when one is set.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDef>,
    fallback: Option<TaskDef>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_id: impl Into<String>, def: TaskDef) -> &mut Self {
        self.tasks.insert(task_id.into(), def);
        self
    }

    pub fn set_fallback(&mut self, def: TaskDef) -> &mut Self {
        self.fallback = Some(def);
        self
    }

    pub fn resolve(&self, task_id: &str) -> Option<&TaskDef> {
        self.tasks.get(task_id).or(self.fallback.as_ref())
    }
}

/// Scoped file access granted to stage functions. Writes resolve inside
/// `<jobDir>/files/{artifacts,logs,tmp}/` only; escapes are forbidden.
#[async_trait]
pub trait StageIo: Send + Sync {
    async fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn write_log(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn write_tmp(&self, name: &str, bytes: &[u8]) -> Result<()>;
    /// Append a line to the task's log file.
    async fn append_log(&self, line: &str) -> Result<()>;
}

/// Result of one inference call.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Opaque model-inference callable. Provider adapters are out of scope;
/// [`EchoInference`] is the built-in deterministic implementation.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<InferenceResponse>;
}

/// Deterministic inference stub: echoes the prompt back. Used as the
/// default provider and in tests.
#[derive(Debug, Clone)]
pub struct EchoInference {
    model: String,
}

impl EchoInference {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for EchoInference {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl Inference for EchoInference {
    async fn complete(&self, prompt: &str) -> Result<InferenceResponse> {
        let tokens = prompt.split_whitespace().count() as u64;
        Ok(InferenceResponse {
            text: prompt.to_string(),
            usage: TokenUsage {
                model: self.model.clone(),
                input_tokens: tokens,
                output_tokens: tokens,
            },
        })
    }
}

/// Inference wrapper that records per-call token usage so the runner can
/// attach it to the task record.
pub struct RecordingInference {
    inner: Arc<dyn Inference>,
    usage: std::sync::Mutex<Vec<TokenUsage>>,
}

impl RecordingInference {
    pub fn new(inner: Arc<dyn Inference>) -> Self {
        Self {
            inner,
            usage: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Drain the usage recorded since the last call.
    pub fn take_usage(&self) -> Vec<TokenUsage> {
        std::mem::take(&mut self.usage.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Inference for RecordingInference {
    async fn complete(&self, prompt: &str) -> Result<InferenceResponse> {
        let response = self.inner.complete(prompt).await?;
        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(response.usage.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn null_io() -> Arc<dyn StageIo> {
        struct NullIo;

        #[async_trait]
        impl StageIo for NullIo {
            async fn write_artifact(&self, _: &str, _: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn write_log(&self, _: &str, _: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn write_tmp(&self, _: &str, _: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn append_log(&self, _: &str) -> Result<()> {
                Ok(())
            }
        }

        Arc::new(NullIo)
    }

    fn context(output: Value) -> StageContext {
        StageContext {
            seed: Arc::new(Seed {
                name: "t".into(),
                data: json!({}),
                pipeline: None,
            }),
            data: Map::new(),
            previous_stage: None,
            output,
            flags: Map::new(),
            io: null_io(),
            llm: Arc::new(EchoInference::default()),
            meta: StageMeta {
                job_id: JobId::parse("j_abc123").unwrap(),
                task_id: "task".into(),
                stage: Stage::Ingestion,
                attempt: 1,
            },
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_then_fallback() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "special",
            TaskDef::new().stage(Stage::Ingestion, |ctx: StageContext| async move {
                Ok(StageOutcome::output(json!({"from": "special", "got": ctx.output})))
            }),
        );
        registry.set_fallback(TaskDef::new());

        assert!(registry.resolve("special").unwrap().get(Stage::Ingestion).is_some());
        // Fallback has no ingestion implementation.
        assert!(registry.resolve("other").unwrap().get(Stage::Ingestion).is_none());

        let f = registry
            .resolve("special")
            .unwrap()
            .get(Stage::Ingestion)
            .unwrap()
            .clone();
        let outcome = f(context(json!(1))).await.unwrap();
        assert_eq!(outcome.output["from"], "special");
    }

    #[tokio::test]
    async fn echo_inference_reports_usage() {
        let llm = EchoInference::new("test-model");
        let response = llm.complete("three word prompt").await.unwrap();
        assert_eq!(response.text, "three word prompt");
        assert_eq!(response.usage.model, "test-model");
        assert_eq!(response.usage.input_tokens, 3);
    }

    #[tokio::test]
    async fn recording_inference_drains_usage() {
        let recording = RecordingInference::new(Arc::new(EchoInference::default()));
        recording.complete("a b").await.unwrap();
        recording.complete("c").await.unwrap();
        let usage = recording.take_usage();
        assert_eq!(usage.len(), 2);
        assert!(recording.take_usage().is_empty());
    }

    #[test]
    fn flag_reads_booleans_only() {
        let mut ctx = context(json!(null));
        ctx.flags
            .insert(FLAG_REFINEMENT_NEEDED.into(), json!(true));
        assert!(ctx.flag(FLAG_REFINEMENT_NEEDED));
        ctx.flags
            .insert(FLAG_REFINEMENT_NEEDED.into(), json!("yes"));
        assert!(!ctx.flag(FLAG_REFINEMENT_NEEDED));
    }
}
