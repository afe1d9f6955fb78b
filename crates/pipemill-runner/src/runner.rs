//! Task-sequence execution with the 11-stage lifecycle.

use chrono::Utc;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use pipemill_config::{PipelineRegistry, PipelineSpec, DEFAULT_PIPELINE};
use pipemill_core::status::{ErrorRecord, JobSnapshot, JobState, TaskState};
use pipemill_core::task::{
    Inference, RecordingInference, StageContext, StageMeta, StageOutcome, TaskDef, TaskRegistry,
    FLAG_REFINEMENT_NEEDED,
};
use pipemill_core::{Error, JobId, Result, Seed, Stage};
use pipemill_store::writer::StatusStore;
use pipemill_store::{promote, JobFiles, PathResolver};

/// Terminal result of one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task reached `done`; the job directory moved to `complete/`.
    Completed,
    /// A task failed; the job stays in `current/` for post-mortem.
    Failed,
    /// A graceful shutdown was requested; the snapshot is flushed and the
    /// job stays in `current/`.
    Interrupted,
}

enum TaskResult {
    Done(Value),
    Failed,
    Interrupted,
}

/// Executes one job's pipeline inside a worker process.
pub struct PipelineRunner {
    resolver: PathResolver,
    registry: Arc<TaskRegistry>,
    llm: Arc<dyn Inference>,
    shutdown: Arc<AtomicBool>,
    slug_override: Option<String>,
}

impl PipelineRunner {
    pub fn new(
        resolver: PathResolver,
        registry: Arc<TaskRegistry>,
        llm: Arc<dyn Inference>,
        shutdown: Arc<AtomicBool>,
        slug_override: Option<String>,
    ) -> Self {
        Self {
            resolver,
            registry,
            llm,
            shutdown,
            slug_override,
        }
    }

    /// Run the job to a terminal state.
    pub async fn run(&self, job_id: &JobId) -> Result<RunOutcome> {
        let job_dir = self.resolver.current(job_id);
        let seed = self.load_seed(&job_dir)?;
        let slug = self
            .slug_override
            .clone()
            .or_else(|| seed.pipeline.clone())
            .unwrap_or_else(|| DEFAULT_PIPELINE.to_string());

        let registry = PipelineRegistry::load(&self.resolver.pipeline_config())
            .map_err(|e| Error::validation(format!("pipeline registry: {e}")))?;
        let spec = registry
            .resolve(&slug)
            .map_err(|e| Error::validation(format!("pipeline {slug:?}: {e}")))?;

        let store = self.open_store(job_id, &job_dir, &seed, &slug, &spec).await?;
        info!(job_id = %job_id, pipeline = %slug, tasks = spec.tasks.len(), "runner starting");

        let seed = Arc::new(seed);
        let mut previous_outputs = Map::new();

        for task_id in &spec.tasks {
            let state = store
                .snapshot()
                .await
                .tasks
                .get(task_id)
                .map(|t| t.state)
                .unwrap_or(TaskState::Pending);

            match state {
                TaskState::Done => {
                    previous_outputs
                        .insert(task_id.clone(), self.load_task_output(&job_dir, task_id));
                    continue;
                }
                TaskState::Failed => {
                    warn!(job_id = %job_id, task = %task_id, "task failed in an earlier run, aborting");
                    return Ok(RunOutcome::Failed);
                }
                TaskState::Pending | TaskState::Running => {}
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(RunOutcome::Interrupted);
            }

            match self
                .run_task(&store, &spec, &seed, &job_dir, task_id, &previous_outputs)
                .await?
            {
                TaskResult::Done(output) => {
                    self.persist_task_output(&job_dir, task_id, &output)?;
                    previous_outputs.insert(task_id.clone(), output);
                }
                TaskResult::Failed => return Ok(RunOutcome::Failed),
                TaskResult::Interrupted => return Ok(RunOutcome::Interrupted),
            }
        }

        promote::promote(&self.resolver, job_id)?;
        info!(job_id = %job_id, "job complete");
        Ok(RunOutcome::Completed)
    }

    fn load_seed(&self, job_dir: &Path) -> Result<Seed> {
        let path = self.resolver.seed_in(job_dir);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::not_found(format!("seed at {}: {e}", path.display())))?;
        Seed::from_json(&bytes)
    }

    /// Load or create the status store, then reconcile it against the
    /// pipeline: new tasks are added as `pending`, tasks caught mid-run
    /// (`running`) are reset to `pending` for re-execution.
    async fn open_store(
        &self,
        job_id: &JobId,
        job_dir: &Path,
        seed: &Seed,
        slug: &str,
        spec: &PipelineSpec,
    ) -> Result<StatusStore> {
        let status_path = self.resolver.status_in(job_dir);
        let store = if status_path.exists() {
            StatusStore::load(&status_path)?
        } else {
            StatusStore::create(
                &status_path,
                JobSnapshot::new(job_id.clone(), &seed.name, slug, &spec.tasks),
            )?
        };

        let task_ids = spec.tasks.clone();
        let slug = slug.to_string();
        store
            .update(move |snap| {
                snap.pipeline = slug;
                for task_id in &task_ids {
                    snap.tasks.entry(task_id.clone()).or_default();
                }
                for task in snap.tasks.values_mut() {
                    if task.state == TaskState::Running {
                        // The stage state was not flushed; re-execute from the top.
                        task.state = TaskState::Pending;
                        task.current_stage = None;
                    }
                }
                snap.state = JobSnapshot::derive_state(&snap.tasks);
                if snap.state != JobState::Running {
                    snap.current = None;
                    snap.current_stage = None;
                }
            })
            .await?;
        Ok(store)
    }

    async fn run_task(
        &self,
        store: &StatusStore,
        spec: &PipelineSpec,
        seed: &Arc<Seed>,
        job_dir: &Path,
        task_id: &str,
        previous_outputs: &Map<String, Value>,
    ) -> Result<TaskResult> {
        let max_refinements = spec.max_refinements(task_id);
        let def = match self.registry.resolve(task_id) {
            Some(def) => def.clone(),
            None => {
                warn!(task = %task_id, "no registered stages, running passthrough");
                TaskDef::new()
            }
        };

        let files = Arc::new(JobFiles::new(&self.resolver, job_dir, task_id)?);
        let llm = Arc::new(RecordingInference::new(self.llm.clone()));
        let started = Utc::now();

        let task_key = task_id.to_string();
        let snap = store
            .update(move |snap| {
                let task = snap.tasks.entry(task_key.clone()).or_default();
                task.state = TaskState::Running;
                task.current_stage = Some(Stage::Ingestion);
                task.attempts += 1;
                task.started_at = Some(started);
                task.ended_at = None;
                task.execution_time_ms = None;
                task.failed_stage = None;
                task.error = None;
                snap.state = JobState::Running;
                snap.current = Some(task_key);
                snap.current_stage = Some(Stage::Ingestion);
            })
            .await?;
        let attempt = snap.tasks[task_id].attempts;
        let mut refinements = snap.tasks[task_id].refinement_attempts;

        let mut data = Map::new();
        data.insert(
            "previousTaskOutputs".to_string(),
            Value::Object(previous_outputs.clone()),
        );
        let mut flags: Map<String, Value> = Map::new();
        let mut output = seed.data.clone();
        let mut previous_stage: Option<Stage> = None;

        let mut index = 0;
        while index < Stage::SEQUENCE.len() {
            let stage = Stage::SEQUENCE[index];

            // critique and refine only run inside the refinement branch below
            if matches!(stage, Stage::Critique | Stage::Refine) {
                index += 1;
                continue;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                info!(task = %task_id, stage = %stage, "shutdown requested, snapshot is flushed");
                return Ok(TaskResult::Interrupted);
            }

            let outcome = self
                .exec_stage(
                    store, &def, seed, &files, &llm, task_id, stage, attempt, &data,
                    previous_stage, &output, &flags,
                )
                .await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.fail_task(store, task_id, stage, &err, started).await?;
                    return Ok(TaskResult::Failed);
                }
            };

            data.insert(stage.name().to_string(), outcome.output.clone());
            for (k, v) in outcome.flags {
                flags.insert(k, v);
            }
            output = outcome.output;
            previous_stage = Some(stage);

            if stage == Stage::ValidateQuality && flag(&flags, FLAG_REFINEMENT_NEEDED) {
                if refinements >= max_refinements {
                    let err = Error::stage(
                        Stage::Refine.name(),
                        format!("refinement limit of {max_refinements} exceeded"),
                    );
                    self.fail_task(store, task_id, Stage::Refine, &err, started)
                        .await?;
                    return Ok(TaskResult::Failed);
                }

                for loop_stage in [Stage::Critique, Stage::Refine] {
                    let outcome = self
                        .exec_stage(
                            store, &def, seed, &files, &llm, task_id, loop_stage, attempt,
                            &data, previous_stage, &output, &flags,
                        )
                        .await;
                    match outcome {
                        Ok(outcome) => {
                            data.insert(loop_stage.name().to_string(), outcome.output.clone());
                            for (k, v) in outcome.flags {
                                flags.insert(k, v);
                            }
                            output = outcome.output;
                            previous_stage = Some(loop_stage);
                        }
                        Err(err) => {
                            self.fail_task(store, task_id, loop_stage, &err, started)
                                .await?;
                            return Ok(TaskResult::Failed);
                        }
                    }
                }

                refinements += 1;
                // The flag is consumed by this pass; validateQuality raises it
                // again if the refined output still falls short.
                flags.remove(FLAG_REFINEMENT_NEEDED);
                let task_key = task_id.to_string();
                store
                    .update(move |snap| {
                        if let Some(task) = snap.tasks.get_mut(&task_key) {
                            task.refinement_attempts = refinements;
                        }
                    })
                    .await?;
                index = Stage::PromptTemplating.index();
                continue;
            }

            index += 1;
        }

        let ended = Utc::now();
        let task_key = task_id.to_string();
        let registered = files.take_registered();
        let usage = llm.take_usage();
        store
            .update(move |snap| {
                if let Some(task) = snap.tasks.get_mut(&task_key) {
                    task.state = TaskState::Done;
                    task.current_stage = None;
                    task.ended_at = Some(ended);
                    task.execution_time_ms =
                        Some((ended - started).num_milliseconds());
                    task.token_usage.extend(usage.iter().cloned());
                    task.files.merge(&registered);
                }
                snap.files.merge(&registered);
                snap.state = JobSnapshot::derive_state(&snap.tasks);
                snap.current = None;
                snap.current_stage = None;
            })
            .await?;
        info!(task = %task_id, "task done");
        Ok(TaskResult::Done(output))
    }

    /// Execute one stage: record it as current, invoke the stage function
    /// (panic-isolated), then register produced files and token usage.
    #[allow(clippy::too_many_arguments)]
    async fn exec_stage(
        &self,
        store: &StatusStore,
        def: &TaskDef,
        seed: &Arc<Seed>,
        files: &Arc<JobFiles>,
        llm: &Arc<RecordingInference>,
        task_id: &str,
        stage: Stage,
        attempt: u32,
        data: &Map<String, Value>,
        previous_stage: Option<Stage>,
        output: &Value,
        flags: &Map<String, Value>,
    ) -> Result<StageOutcome> {
        let task_key = task_id.to_string();
        store
            .update(move |snap| {
                if let Some(task) = snap.tasks.get_mut(&task_key) {
                    task.current_stage = Some(stage);
                }
                snap.current_stage = Some(stage);
            })
            .await?;

        let result = match def.get(stage) {
            None => Ok(StageOutcome::output(output.clone())),
            Some(f) => {
                let ctx = StageContext {
                    seed: seed.clone(),
                    data: data.clone(),
                    previous_stage,
                    output: output.clone(),
                    flags: flags.clone(),
                    io: files.clone(),
                    llm: llm.clone(),
                    meta: StageMeta {
                        job_id: store.snapshot().await.id.clone(),
                        task_id: task_id.to_string(),
                        stage,
                        attempt,
                    },
                };
                let fut = f(ctx);
                match tokio::spawn(fut).await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_panic() => Err(Error::stage(
                        stage.name(),
                        format!("stage panicked: {join_err}"),
                    )),
                    Err(join_err) => Err(Error::stage(stage.name(), join_err.to_string())),
                }
            }
        };

        // Files and usage produced so far become visible even if the stage
        // itself failed afterwards.
        let registered = files.take_registered();
        let usage = llm.take_usage();
        if !registered.is_empty() || !usage.is_empty() {
            let task_key = task_id.to_string();
            store
                .update(move |snap| {
                    if let Some(task) = snap.tasks.get_mut(&task_key) {
                        task.token_usage.extend(usage.iter().cloned());
                        task.files.merge(&registered);
                    }
                    snap.files.merge(&registered);
                })
                .await?;
        }

        result
    }

    async fn fail_task(
        &self,
        store: &StatusStore,
        task_id: &str,
        stage: Stage,
        err: &Error,
        started: chrono::DateTime<Utc>,
    ) -> Result<()> {
        error!(task = %task_id, stage = %stage, error = %err, "task failed");
        let task_key = task_id.to_string();
        let record = ErrorRecord {
            message: err.to_string(),
            stack: None,
            debug: Some(serde_json::json!({ "stage": stage.name() })),
        };
        store
            .update(move |snap| {
                let ended = Utc::now();
                if let Some(task) = snap.tasks.get_mut(&task_key) {
                    task.state = TaskState::Failed;
                    task.failed_stage = Some(stage);
                    task.current_stage = None;
                    task.error = Some(record);
                    task.ended_at = Some(ended);
                    task.execution_time_ms = Some((ended - started).num_milliseconds());
                }
                snap.state = JobState::Failed;
                snap.current = None;
                snap.current_stage = None;
            })
            .await?;
        Ok(())
    }

    /// Earlier tasks hand their final `integration` output to later tasks
    /// through `tasks/<taskId>/output.json`, which also survives a restart.
    fn persist_task_output(&self, job_dir: &Path, task_id: &str, output: &Value) -> Result<()> {
        let path = self.resolver.task_dir(job_dir, task_id).join("output.json");
        let bytes = serde_json::to_vec_pretty(output)
            .map_err(|e| Error::FatalIo(format!("serialize task output: {e}")))?;
        pipemill_store::atomic::write_atomic(&path, &bytes)
            .map_err(|e| Error::FatalIo(format!("persist task output: {e}")))
    }

    fn load_task_output(&self, job_dir: &Path, task_id: &str) -> Value {
        let path = self.resolver.task_dir(job_dir, task_id).join("output.json");
        std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or(Value::Null)
    }
}

fn flag(flags: &Map<String, Value>, name: &str) -> bool {
    flags.get(name).and_then(Value::as_bool).unwrap_or(false)
}
