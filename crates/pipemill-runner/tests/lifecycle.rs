//! End-to-end runner scenarios against a temporary data root.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pipemill_core::status::{JobState, TaskState};
use pipemill_core::task::{
    EchoInference, StageContext, StageOutcome, TaskDef, TaskRegistry, FLAG_REFINEMENT_NEEDED,
};
use pipemill_core::{JobId, Stage};
use pipemill_runner::{PipelineRunner, RunOutcome};
use pipemill_store::writer::persist_snapshot;
use pipemill_store::PathResolver;

struct Fixture {
    _dir: tempfile::TempDir,
    resolver: PathResolver,
    job_id: JobId,
}

fn fixture(pipeline_json: &str, seed_json: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dir.path());
    let job_id = JobId::parse("j_abc123").unwrap();

    let pipeline_dir = resolver.pipeline_dir("default");
    std::fs::create_dir_all(&pipeline_dir).unwrap();
    std::fs::write(pipeline_dir.join("pipeline.json"), pipeline_json).unwrap();

    let job_dir = resolver.current(&job_id);
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(resolver.seed_in(&job_dir), seed_json).unwrap();

    Fixture {
        _dir: dir,
        resolver,
        job_id,
    }
}

fn runner(fixture: &Fixture, registry: TaskRegistry) -> PipelineRunner {
    PipelineRunner::new(
        fixture.resolver.clone(),
        Arc::new(registry),
        Arc::new(EchoInference::default()),
        Arc::new(AtomicBool::new(false)),
        None,
    )
}

fn final_snapshot(fixture: &Fixture, phase: &str) -> Value {
    let dir = match phase {
        "current" => fixture.resolver.current(&fixture.job_id),
        _ => fixture.resolver.complete(&fixture.job_id),
    };
    let bytes = std::fs::read(fixture.resolver.status_in(&dir)).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A task that stamps its id into the output and records invocations.
fn stamping_task(counter: Arc<AtomicUsize>, seen_previous: Arc<std::sync::Mutex<Value>>) -> TaskDef {
    TaskDef::new().stage(Stage::Integration, move |ctx: StageContext| {
        let counter = counter.clone();
        let seen_previous = seen_previous.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            *seen_previous.lock().unwrap() = ctx
                .data
                .get("previousTaskOutputs")
                .cloned()
                .unwrap_or(Value::Null);
            ctx.io
                .write_artifact("stamp.json", ctx.meta.task_id.as_bytes())
                .await?;
            Ok(StageOutcome::output(json!({ "task": ctx.meta.task_id })))
        }
    })
}

#[tokio::test]
async fn completes_and_promotes_a_two_task_job() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha", "beta"]}"#,
        r#"{"name": "e2e", "data": {"t": "x"}}"#,
    );

    let alpha_runs = Arc::new(AtomicUsize::new(0));
    let beta_previous = Arc::new(std::sync::Mutex::new(Value::Null));
    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        stamping_task(alpha_runs.clone(), Arc::new(std::sync::Mutex::new(Value::Null))),
    );
    registry.register(
        "beta",
        stamping_task(Arc::new(AtomicUsize::new(0)), beta_previous.clone()),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    assert!(!fx.resolver.current(&fx.job_id).exists());
    let snap = final_snapshot(&fx, "complete");
    assert_eq!(snap["state"], "complete");
    assert_eq!(snap["current"], Value::Null);
    for task in ["alpha", "beta"] {
        assert_eq!(snap["tasks"][task]["state"], "done");
        assert_eq!(snap["tasks"][task]["attempts"], 1);
        assert!(snap["tasks"][task]["executionTimeMs"].is_i64());
        assert_eq!(snap["tasks"][task]["files"]["artifacts"][0], "stamp.json");
    }
    assert_eq!(alpha_runs.load(Ordering::SeqCst), 1);

    // beta saw alpha's integration output
    let previous = beta_previous.lock().unwrap().clone();
    assert_eq!(previous["alpha"]["task"], "alpha");
}

#[tokio::test]
async fn refinement_loop_exceeding_the_bound_fails_the_task() {
    let fx = fixture(
        r#"{
            "name": "default",
            "tasks": ["alpha"],
            "taskConfig": {"alpha": {"maxRefinements": 2}}
        }"#,
        r#"{"name": "e2e", "data": {}}"#,
    );

    let critique_runs = Arc::new(AtomicUsize::new(0));
    let critique_counter = critique_runs.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        TaskDef::new()
            .stage(Stage::ValidateQuality, |ctx: StageContext| async move {
                Ok(StageOutcome::output(ctx.output).with_flag(FLAG_REFINEMENT_NEEDED, true))
            })
            .stage(Stage::Critique, move |ctx: StageContext| {
                let counter = critique_counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::output(ctx.output))
                }
            }),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let snap = final_snapshot(&fx, "current");
    assert_eq!(snap["state"], "failed");
    assert_eq!(snap["tasks"]["alpha"]["state"], "failed");
    assert_eq!(snap["tasks"]["alpha"]["failedStage"], "refine");
    assert_eq!(snap["tasks"]["alpha"]["refinementAttempts"], 2);
    assert!(snap["tasks"]["alpha"]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("refinement limit"));
    assert_eq!(critique_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn refinement_that_recovers_completes_the_task() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha"]}"#,
        r#"{"name": "e2e", "data": {}}"#,
    );

    let quality_calls = Arc::new(AtomicUsize::new(0));
    let templating_calls = Arc::new(AtomicUsize::new(0));
    let quality_counter = quality_calls.clone();
    let templating_counter = templating_calls.clone();

    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        TaskDef::new()
            .stage(Stage::PromptTemplating, move |ctx: StageContext| {
                let counter = templating_counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::output(ctx.output))
                }
            })
            .stage(Stage::ValidateQuality, move |ctx: StageContext| {
                let counter = quality_counter.clone();
                async move {
                    let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                    let mut outcome = StageOutcome::output(ctx.output);
                    if first {
                        outcome = outcome.with_flag(FLAG_REFINEMENT_NEEDED, true);
                    }
                    Ok(outcome)
                }
            }),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let snap = final_snapshot(&fx, "complete");
    assert_eq!(snap["tasks"]["alpha"]["state"], "done");
    assert_eq!(snap["tasks"]["alpha"]["refinementAttempts"], 1);
    // one initial pass plus one refinement re-entry
    assert_eq!(templating_calls.load(Ordering::SeqCst), 2);
    assert_eq!(quality_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_stage_error_fails_the_task_and_stops_the_job() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha", "beta"]}"#,
        r#"{"name": "e2e", "data": {}}"#,
    );

    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        TaskDef::new().stage(Stage::PreProcessing, |_ctx: StageContext| async move {
            Err(pipemill_core::Error::stage("preProcessing", "bad input"))
        }),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let snap = final_snapshot(&fx, "current");
    assert_eq!(snap["state"], "failed");
    assert_eq!(snap["tasks"]["alpha"]["state"], "failed");
    assert_eq!(snap["tasks"]["alpha"]["failedStage"], "preProcessing");
    assert!(snap["tasks"]["alpha"]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("bad input"));
    // forward progress stopped
    assert_eq!(snap["tasks"]["beta"]["state"], "pending");
}

#[tokio::test]
async fn resume_skips_done_tasks_and_reruns_interrupted_ones() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha", "beta"]}"#,
        r#"{"name": "e2e", "data": {}}"#,
    );
    let job_dir = fx.resolver.current(&fx.job_id);

    // Simulate a crash: alpha finished, beta was mid-flight.
    let mut snapshot = pipemill_core::status::JobSnapshot::new(
        fx.job_id.clone(),
        "e2e",
        "default",
        &["alpha".to_string(), "beta".to_string()],
    );
    snapshot.tasks.get_mut("alpha").unwrap().state = TaskState::Done;
    let beta = snapshot.tasks.get_mut("beta").unwrap();
    beta.state = TaskState::Running;
    beta.current_stage = Some(Stage::Inference);
    beta.attempts = 1;
    snapshot.state = JobState::Running;
    snapshot.current = Some("beta".to_string());
    persist_snapshot(&fx.resolver.status_in(&job_dir), &snapshot).unwrap();

    let alpha_output = fx.resolver.task_dir(&job_dir, "alpha").join("output.json");
    std::fs::create_dir_all(alpha_output.parent().unwrap()).unwrap();
    std::fs::write(&alpha_output, r#"{"task": "alpha"}"#).unwrap();

    let alpha_runs = Arc::new(AtomicUsize::new(0));
    let beta_previous = Arc::new(std::sync::Mutex::new(Value::Null));
    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        stamping_task(alpha_runs.clone(), Arc::new(std::sync::Mutex::new(Value::Null))),
    );
    registry.register(
        "beta",
        stamping_task(Arc::new(AtomicUsize::new(0)), beta_previous.clone()),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    // alpha was not re-executed; beta re-ran from the top
    assert_eq!(alpha_runs.load(Ordering::SeqCst), 0);
    let snap = final_snapshot(&fx, "complete");
    assert_eq!(snap["tasks"]["beta"]["state"], "done");
    assert_eq!(snap["tasks"]["beta"]["attempts"], 2);

    // beta still saw alpha's persisted output
    let previous = beta_previous.lock().unwrap().clone();
    assert_eq!(previous["alpha"]["task"], "alpha");
}

#[tokio::test]
async fn every_stage_is_observable_in_some_snapshot_before_it_runs() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha"]}"#,
        r#"{"name": "e2e", "data": {}}"#,
    );

    // The inference stage reads the status file from disk and asserts the
    // persisted currentStage already names it.
    let resolver = fx.resolver.clone();
    let job_id = fx.job_id.clone();
    let observed = Arc::new(std::sync::Mutex::new(String::new()));
    let observed_in_stage = observed.clone();

    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        TaskDef::new().stage(Stage::Inference, move |ctx: StageContext| {
            let resolver = resolver.clone();
            let job_id = job_id.clone();
            let observed = observed_in_stage.clone();
            async move {
                let bytes =
                    std::fs::read(resolver.status_in(&resolver.current(&job_id))).unwrap();
                let snap: Value = serde_json::from_slice(&bytes).unwrap();
                *observed.lock().unwrap() = snap["tasks"]["alpha"]["currentStage"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                Ok(StageOutcome::output(ctx.output))
            }
        }),
    );

    runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(observed.lock().unwrap().as_str(), "inference");
}

#[tokio::test]
async fn running_an_already_complete_job_is_a_no_op() {
    let fx = fixture(
        r#"{"name": "default", "tasks": ["alpha"]}"#,
        r#"{"name": "e2e", "data": {}}"#,
    );
    let job_dir = fx.resolver.current(&fx.job_id);

    let mut snapshot = pipemill_core::status::JobSnapshot::new(
        fx.job_id.clone(),
        "e2e",
        "default",
        &["alpha".to_string()],
    );
    snapshot.tasks.get_mut("alpha").unwrap().state = TaskState::Done;
    snapshot.state = JobState::Complete;
    persist_snapshot(&fx.resolver.status_in(&job_dir), &snapshot).unwrap();

    let alpha_runs = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    registry.register(
        "alpha",
        stamping_task(alpha_runs.clone(), Arc::new(std::sync::Mutex::new(Value::Null))),
    );

    let outcome = runner(&fx, registry).run(&fx.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(alpha_runs.load(Ordering::SeqCst), 0);
}
