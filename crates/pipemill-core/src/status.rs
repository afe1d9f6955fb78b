//! The authoritative status snapshot model.
//!
//! `tasks-status.json` is the single source of truth for a job. It is only
//! mutated through the status writer, which validates the invariants in
//! [`JobSnapshot::validate`] before every persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, JobId, Result, Stage};

/// Job-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }
}

/// Task-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

/// Kind of file produced by a task stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Artifacts,
    Logs,
    Tmp,
}

impl FileKind {
    pub const ALL: [FileKind; 3] = [FileKind::Artifacts, FileKind::Logs, FileKind::Tmp];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Artifacts => "artifacts",
            FileKind::Logs => "logs",
            FileKind::Tmp => "tmp",
        }
    }
}

impl std::str::FromStr for FileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "artifacts" => Ok(FileKind::Artifacts),
            "logs" => Ok(FileKind::Logs),
            "tmp" => Ok(FileKind::Tmp),
            other => Err(Error::validation(format!("invalid file type: {other:?}"))),
        }
    }
}

/// Registered file names per kind. Names only, never paths; the files
/// themselves live under `<jobDir>/files/{artifacts,logs,tmp}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSets {
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub tmp: Vec<String>,
}

impl FileSets {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.logs.is_empty() && self.tmp.is_empty()
    }

    pub fn names(&self, kind: FileKind) -> &[String] {
        match kind {
            FileKind::Artifacts => &self.artifacts,
            FileKind::Logs => &self.logs,
            FileKind::Tmp => &self.tmp,
        }
    }

    /// Register a name under a kind, keeping the list free of duplicates.
    pub fn register(&mut self, kind: FileKind, name: &str) {
        let list = match kind {
            FileKind::Artifacts => &mut self.artifacts,
            FileKind::Logs => &mut self.logs,
            FileKind::Tmp => &mut self.tmp,
        };
        if !list.iter().any(|n| n == name) {
            list.push(name.to_string());
        }
    }

    /// Merge every name from `other` into self.
    pub fn merge(&mut self, other: &FileSets) {
        for kind in FileKind::ALL {
            for name in other.names(kind) {
                self.register(kind, name);
            }
        }
    }
}

/// Token consumption reported by one inference call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Captured failure of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            debug: None,
        }
    }
}

/// Per-task record inside the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub state: TaskState,
    pub current_stage: Option<Stage>,
    pub failed_stage: Option<Stage>,
    pub attempts: u32,
    pub refinement_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub token_usage: Vec<TokenUsage>,
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub files: FileSets,
}

impl TaskRecord {
    pub fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            current_stage: None,
            failed_stage: None,
            attempts: 0,
            refinement_attempts: 0,
            started_at: None,
            ended_at: None,
            execution_time_ms: None,
            token_usage: Vec::new(),
            error: None,
            files: FileSets::default(),
        }
    }

    /// Return the record to `pending`, clearing execution bookkeeping.
    /// Registered files are preserved.
    pub fn reset(&mut self, clear_token_usage: bool) {
        self.state = TaskState::Pending;
        self.current_stage = None;
        self.failed_stage = None;
        self.attempts = 0;
        self.refinement_attempts = 0;
        self.started_at = None;
        self.ended_at = None;
        self.execution_time_ms = None;
        self.error = None;
        if clear_token_usage {
            self.token_usage.clear();
        }
    }
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self::pending()
    }
}

/// The authoritative job status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub pipeline: String,
    pub state: JobState,
    /// Currently active task id, non-null exactly while `state == running`.
    pub current: Option<String>,
    pub current_stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub files: FileSets,
}

impl JobSnapshot {
    /// Fresh snapshot with every task pending.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        pipeline: impl Into<String>,
        task_ids: &[String],
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            pipeline: pipeline.into(),
            state: JobState::Pending,
            current: None,
            current_stage: None,
            created_at: now,
            last_updated: now,
            tasks: task_ids
                .iter()
                .map(|t| (t.clone(), TaskRecord::pending()))
                .collect(),
            files: FileSets::default(),
        }
    }

    /// Job state implied by the task states.
    ///
    /// Priority: any failed -> failed, any running -> running,
    /// all done -> complete, else pending.
    pub fn derive_state(tasks: &BTreeMap<String, TaskRecord>) -> JobState {
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

    /// Check the snapshot invariants. Called by the writer before every
    /// persist; a violation aborts the write.
    pub fn validate(&self) -> Result<()> {
        let all_done =
            !self.tasks.is_empty() && self.tasks.values().all(|t| t.state == TaskState::Done);
        if (self.state == JobState::Complete) != all_done {
            return Err(Error::Invariant(format!(
                "state is {} but {} tasks are done",
                self.state.as_str(),
                self.tasks
                    .values()
                    .filter(|t| t.state == TaskState::Done)
                    .count(),
            )));
        }

        let any_failed = self.tasks.values().any(|t| t.state == TaskState::Failed);
        if (self.state == JobState::Failed) != any_failed {
            return Err(Error::Invariant(format!(
                "state is {} but a failed task {} present",
                self.state.as_str(),
                if any_failed { "is" } else { "is not" },
            )));
        }

        if (self.state == JobState::Running) != self.current.is_some() {
            return Err(Error::Invariant(format!(
                "state is {} but current task is {:?}",
                self.state.as_str(),
                self.current,
            )));
        }

        if let Some(current) = &self.current {
            if !self.tasks.contains_key(current) {
                return Err(Error::Invariant(format!(
                    "current task {current:?} is not in the task map"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(task_states: &[(&str, TaskState)]) -> JobSnapshot {
        let ids: Vec<String> = task_states.iter().map(|(t, _)| t.to_string()).collect();
        let mut snap = JobSnapshot::new(JobId::parse("j_abc123").unwrap(), "test", "default", &ids);
        for (id, state) in task_states {
            snap.tasks.get_mut(*id).unwrap().state = *state;
        }
        snap.state = JobSnapshot::derive_state(&snap.tasks);
        if snap.state == JobState::Running {
            snap.current = task_states
                .iter()
                .find(|(_, s)| *s == TaskState::Running)
                .map(|(t, _)| t.to_string());
        }
        snap
    }

    #[test]
    fn derive_state_priority() {
        use TaskState::*;
        assert_eq!(
            snapshot(&[("a", Failed), ("b", Running)]).state,
            JobState::Failed
        );
        assert_eq!(
            snapshot(&[("a", Done), ("b", Running)]).state,
            JobState::Running
        );
        assert_eq!(snapshot(&[("a", Done), ("b", Done)]).state, JobState::Complete);
        assert_eq!(
            snapshot(&[("a", Done), ("b", Pending)]).state,
            JobState::Pending
        );
    }

    #[test]
    fn valid_snapshots_pass() {
        use TaskState::*;
        for states in [
            vec![("a", Pending)],
            vec![("a", Done), ("b", Running)],
            vec![("a", Done), ("b", Done)],
            vec![("a", Failed)],
        ] {
            let snap = snapshot(&states);
            assert!(snap.validate().is_ok(), "{states:?} should validate");
        }
    }

    #[test]
    fn complete_requires_all_done() {
        let mut snap = snapshot(&[("a", TaskState::Done), ("b", TaskState::Pending)]);
        snap.state = JobState::Complete;
        assert!(matches!(snap.validate(), Err(Error::Invariant(_))));
    }

    #[test]
    fn failed_requires_a_failed_task() {
        let mut snap = snapshot(&[("a", TaskState::Pending)]);
        snap.state = JobState::Failed;
        assert!(matches!(snap.validate(), Err(Error::Invariant(_))));
    }

    #[test]
    fn current_iff_running() {
        let mut snap = snapshot(&[("a", TaskState::Running)]);
        snap.current = None;
        assert!(matches!(snap.validate(), Err(Error::Invariant(_))));

        let mut snap = snapshot(&[("a", TaskState::Pending)]);
        snap.current = Some("a".to_string());
        assert!(matches!(snap.validate(), Err(Error::Invariant(_))));
    }

    #[test]
    fn current_must_exist_in_task_map() {
        let mut snap = snapshot(&[("a", TaskState::Running)]);
        snap.current = Some("ghost".to_string());
        assert!(matches!(snap.validate(), Err(Error::Invariant(_))));
    }

    #[test]
    fn reset_preserves_files() {
        let mut rec = TaskRecord::pending();
        rec.state = TaskState::Failed;
        rec.attempts = 2;
        rec.refinement_attempts = 3;
        rec.failed_stage = Some(Stage::Refine);
        rec.error = Some(ErrorRecord::new("boom"));
        rec.token_usage.push(TokenUsage::default());
        rec.files.register(FileKind::Artifacts, "out.json");

        rec.reset(true);
        assert_eq!(rec.state, TaskState::Pending);
        assert_eq!(rec.attempts, 0);
        assert_eq!(rec.refinement_attempts, 0);
        assert!(rec.failed_stage.is_none());
        assert!(rec.error.is_none());
        assert!(rec.token_usage.is_empty());
        assert_eq!(rec.files.artifacts, vec!["out.json"]);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = snapshot(&[("a", TaskState::Pending)]);
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("lastUpdated").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("currentStage").is_some());
        let task = &json["tasks"]["a"];
        assert!(task.get("refinementAttempts").is_some());
        assert!(task.get("executionTimeMs").is_some());
        assert!(task.get("tokenUsage").is_some());
    }
}
