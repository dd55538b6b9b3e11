//! TaskRecord and its supporting enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record};
use tracing::debug;

use super::now_ms;
use super::run::RunId;

/// The kind of work a task represents, used both for template
/// selection and for the Guard's BLOCKED-promotion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    ReadInfo,
    Report,
    LightEdit,
    Implementation,
    ReviewResponse,
    ConfigCiChange,
    DangerousOp,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::ReadInfo => "READ_INFO",
            TaskType::Report => "REPORT",
            TaskType::LightEdit => "LIGHT_EDIT",
            TaskType::Implementation => "IMPLEMENTATION",
            TaskType::ReviewResponse => "REVIEW_RESPONSE",
            TaskType::ConfigCiChange => "CONFIG_CI_CHANGE",
            TaskType::DangerousOp => "DANGEROUS_OP",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingResponse,
    Complete,
    Incomplete,
    Error,
    Cancelled,
    /// Only valid when `task_type = DANGEROUS_OP`; the Guard rewrites
    /// this to `Incomplete` for every other task type.
    Blocked,
}

impl TaskStatus {
    /// Terminal statuses never regress to a non-terminal one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Incomplete | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::AwaitingResponse => "AWAITING_RESPONSE",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Incomplete => "INCOMPLETE",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Blocked => "BLOCKED",
        };
        write!(f, "{s}")
    }
}

/// One progress signal appended to a task's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    Heartbeat,
    ToolProgress,
    LogChunk,
    /// Emitted by `QueueStore::update_status` on every transition.
    StatusChanged { from: TaskStatus, to: TaskStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn status_changed(from: TaskStatus, to: TaskStatus) -> Self {
        Self::new(ProgressKind::StatusChanged { from, to }, serde_json::Value::Null)
    }
}

/// Durable record of one task, from submission through a terminal
/// state. Never deleted: terminal records remain for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub namespace: String,
    pub session_id: String,
    pub thread_id: String,
    pub run_id: Option<RunId>,
    pub parent_task_id: Option<String>,
    pub task_type: TaskType,
    pub prompt: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub files_modified: Vec<String>,
    pub progress_events: Vec<ProgressEvent>,
    pub attempt_count: u32,
    /// Insertion sequence within the owning namespace; guarantees
    /// enqueue-order dispatch independent of later mutation.
    pub seq: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl TaskRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        namespace: impl Into<String>,
        session_id: impl Into<String>,
        thread_id: impl Into<String>,
        parent_task_id: Option<String>,
        task_type: TaskType,
        prompt: impl Into<String>,
        seq: i64,
    ) -> Self {
        let now = now_ms();
        let task_id = task_id.into();
        debug!(%task_id, ?task_type, "TaskRecord::new: called");
        Self {
            task_id,
            namespace: namespace.into(),
            session_id: session_id.into(),
            thread_id: thread_id.into(),
            run_id: None,
            parent_task_id,
            task_type,
            prompt: prompt.into(),
            status: TaskStatus::Queued,
            output: None,
            error: None,
            files_modified: Vec::new(),
            progress_events: Vec::new(),
            attempt_count: 0,
            seq,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn append_event(&mut self, event: ProgressEvent) {
        self.progress_events.push(event);
        self.updated_at = now_ms();
    }
}

impl Record for TaskRecord {
    fn id(&self) -> String {
        self.task_id.clone()
    }

    fn collection() -> &'static str {
        "tasks"
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn seq_key(&self) -> i64 {
        self.seq
    }

    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("status", IndexValue::String(self.status.to_string())),
            ("session_id", IndexValue::String(self.session_id.clone())),
            ("namespace", IndexValue::String(self.namespace.clone())),
        ]
    }
}

/// Detect the task type implied by a free-form prompt.
///
/// Ambiguous input defaults to `READ_INFO` uniformly, regardless of
/// script/language: an `INCOMPLETE READ_INFO` becomes
/// `AWAITING_RESPONSE`, which the user can clarify, whereas an
/// `INCOMPLETE IMPLEMENTATION` would drop output and become `ERROR`.
pub fn detect_task_type(prompt: &str) -> TaskType {
    let lower = prompt.to_lowercase();
    debug!(prompt_len = prompt.len(), "detect_task_type: called");

    const DANGEROUS: &[&str] = &[
        "rm -rf", "drop table", "drop database", "force push", "force-push", "delete all", "truncate table",
        "sudo rm", "git push --force",
    ];
    const CONFIG_CI: &[&str] = &[
        "ci.yml", "ci.yaml", "github actions", "github/workflows", ".circleci", "dockerfile", "ci pipeline",
        "workflow file",
    ];
    const REVIEW_RESPONSE: &[&str] = &[
        "address review", "review comment", "respond to review", "pr feedback", "address the feedback",
        "reviewer left",
    ];
    const IMPLEMENTATION: &[&str] = &[
        "implement", "add a feature", "add feature", "create a function", "build a", "write code",
        "add support for", "add an endpoint", "create a module",
    ];
    const LIGHT_EDIT: &[&str] = &["fix typo", "rename", "small fix", "tweak", "bump version", "update comment"];
    const REPORT: &[&str] = &["summarize", "write a report", "report on", "give me a summary"];

    if DANGEROUS.iter().any(|kw| lower.contains(kw)) {
        return TaskType::DangerousOp;
    }
    if CONFIG_CI.iter().any(|kw| lower.contains(kw)) {
        return TaskType::ConfigCiChange;
    }
    if REVIEW_RESPONSE.iter().any(|kw| lower.contains(kw)) {
        return TaskType::ReviewResponse;
    }
    if LIGHT_EDIT.iter().any(|kw| lower.contains(kw)) {
        return TaskType::LightEdit;
    }
    if IMPLEMENTATION.iter().any(|kw| lower.contains(kw)) {
        return TaskType::Implementation;
    }
    if REPORT.iter().any(|kw| lower.contains(kw)) {
        return TaskType::Report;
    }
    TaskType::ReadInfo
}
