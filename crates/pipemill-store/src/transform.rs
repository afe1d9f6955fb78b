//! Snapshot-to-API transformation.
//!
//! Maps a raw status document to the canonical wire schema used by both
//! the HTTP responses and the SSE payloads: internal `tasks` becomes
//! `tasksStatus`, task states are normalized, `pipelineLabel`, `progress`,
//! `status`, and `displayCategory` are derived.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use pipemill_core::status::{JobState, TaskState};

use crate::reader::{JobLocation, RawJob};

/// UI grouping bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayCategory {
    Errors,
    Current,
    Complete,
}

/// Normalized task entry on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub state: TaskState,
    pub current_stage: Option<Value>,
    pub failed_stage: Option<Value>,
    pub attempts: u64,
    pub refinement_attempts: u64,
    pub started_at: Option<Value>,
    pub ended_at: Option<Value>,
    pub execution_time_ms: Option<Value>,
    pub token_usage: Value,
    pub error: Option<Value>,
    pub files: Value,
    /// Present when the raw record carried an unknown state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Canonical job payload for lists, details, and SSE events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub pipeline: String,
    pub pipeline_label: String,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub location: JobLocation,
    pub display_category: DisplayCategory,
    pub created_at: Option<Value>,
    pub last_updated: Option<Value>,
    pub current: Option<String>,
    pub current_stage: Option<Value>,
    pub tasks_status: BTreeMap<String, TaskView>,
    pub files: Value,
}

/// Shape a raw job read into the canonical schema.
pub fn summarize(job: &RawJob) -> JobSummary {
    let raw = &job.raw;
    let tasks_status = task_views(raw.get("tasks"));

    let status = job_status(raw.get("state"), &tasks_status);
    let pipeline = str_field(raw, "pipeline").unwrap_or_else(|| "default".to_string());

    JobSummary {
        id: str_field(raw, "id").unwrap_or_else(|| job.job_id.to_string()),
        name: str_field(raw, "name").unwrap_or_default(),
        pipeline_label: humanize_slug(&pipeline),
        pipeline,
        status,
        progress: progress(&tasks_status),
        location: job.location,
        display_category: display_category(status, &tasks_status),
        created_at: raw.get("createdAt").cloned(),
        last_updated: raw.get("lastUpdated").cloned(),
        current: str_field(raw, "current"),
        current_stage: raw.get("currentStage").cloned().filter(|v| !v.is_null()),
        tasks_status,
        files: raw.get("files").cloned().unwrap_or_else(|| {
            serde_json::json!({"artifacts": [], "logs": [], "tmp": []})
        }),
    }
}

fn task_views(tasks: Option<&Value>) -> BTreeMap<String, TaskView> {
    let mut views = BTreeMap::new();
    let Some(map) = tasks.and_then(Value::as_object) else {
        return views;
    };
    for (task_id, rec) in map {
        let (state, warning) = normalize_state(rec.get("state"));
        views.insert(
            task_id.clone(),
            TaskView {
                state,
                current_stage: rec.get("currentStage").cloned().filter(|v| !v.is_null()),
                failed_stage: rec.get("failedStage").cloned().filter(|v| !v.is_null()),
                attempts: rec.get("attempts").and_then(Value::as_u64).unwrap_or(0),
                refinement_attempts: rec
                    .get("refinementAttempts")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                started_at: rec.get("startedAt").cloned().filter(|v| !v.is_null()),
                ended_at: rec.get("endedAt").cloned().filter(|v| !v.is_null()),
                execution_time_ms: rec
                    .get("executionTimeMs")
                    .cloned()
                    .filter(|v| !v.is_null()),
                token_usage: rec
                    .get("tokenUsage")
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
                error: rec.get("error").cloned().filter(|v| !v.is_null()),
                files: rec.get("files").cloned().unwrap_or_else(|| {
                    serde_json::json!({"artifacts": [], "logs": [], "tmp": []})
                }),
                warning,
            },
        );
    }
    views
}

/// Unknown or missing task states become `pending` with a warning tag.
fn normalize_state(state: Option<&Value>) -> (TaskState, Option<String>) {
    match state.and_then(Value::as_str) {
        Some("pending") => (TaskState::Pending, None),
        Some("running") => (TaskState::Running, None),
        Some("done") => (TaskState::Done, None),
        Some("failed") => (TaskState::Failed, None),
        Some(other) => (
            TaskState::Pending,
            Some(format!("unknown task state {other:?}")),
        ),
        None => (TaskState::Pending, Some("missing task state".to_string())),
    }
}

/// Job status from the snapshot, derived from task states when absent or
/// unknown. Priority: any failed, any running, all done, else pending.
fn job_status(state: Option<&Value>, tasks: &BTreeMap<String, TaskView>) -> JobState {
    match state.and_then(Value::as_str) {
        Some("pending") => JobState::Pending,
        Some("running") => JobState::Running,
        Some("complete") => JobState::Complete,
        Some("failed") => JobState::Failed,
        _ => {
            if tasks.values().any(|t| t.state == TaskState::Failed) {
                JobState::Failed
            } else if tasks.values().any(|t| t.state == TaskState::Running) {
                JobState::Running
            } else if !tasks.is_empty() && tasks.values().all(|t| t.state == TaskState::Done) {
                JobState::Complete
            } else {
                JobState::Pending
            }
        }
    }
}

fn progress(tasks: &BTreeMap<String, TaskView>) -> Option<u8> {
    if tasks.is_empty() {
        return None;
    }
    let done = tasks.values().filter(|t| t.state == TaskState::Done).count();
    Some((100.0 * done as f64 / tasks.len() as f64).round() as u8)
}

fn display_category(status: JobState, tasks: &BTreeMap<String, TaskView>) -> DisplayCategory {
    let any_failed = tasks.values().any(|t| t.state == TaskState::Failed);
    let any_running = tasks.values().any(|t| t.state == TaskState::Running);
    let all_done = !tasks.is_empty() && tasks.values().all(|t| t.state == TaskState::Done);

    if any_failed || status == JobState::Failed {
        DisplayCategory::Errors
    } else if any_running || status == JobState::Running {
        DisplayCategory::Current
    } else if all_done {
        DisplayCategory::Complete
    } else {
        DisplayCategory::Current
    }
}

/// `content-gen` -> `Content Gen`.
fn humanize_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}
