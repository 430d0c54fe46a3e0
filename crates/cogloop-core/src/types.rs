//! Core record types shared by the execution engine, the store and the queue.
//!
//! Every type here is a plain serde record. The store persists them as JSON
//! documents; nothing in this module touches the filesystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Default number of execution attempts a task gets before it is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Unique identifier for tasks and archived artifacts.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Execution ---

/// How a single process execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "exit_code", rename_all = "snake_case")]
pub enum Outcome {
    /// Ran to completion with exit code 0.
    Success,
    /// Ran to completion with a non-zero exit code (`-1` if killed by a signal).
    NonZeroExit(i32),
    /// Exceeded its wall-clock budget and was killed.
    TimedOut,
    /// Rejected by the deny-list; nothing was spawned.
    Blocked,
    /// The process could not be created.
    SpawnError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit(_) => "non_zero_exit",
            Self::TimedOut => "timed_out",
            Self::Blocked => "blocked",
            Self::SpawnError => "spawn_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Exit code when the process ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::NonZeroExit(code) => Some(*code),
            Self::TimedOut | Self::Blocked | Self::SpawnError => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "non_zero_exit({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of one `execute()` call. Never mutated after the runner returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Rendered command line, as checked against the deny-list.
    pub command: String,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Timeout that applied, in milliseconds.
    pub timeout_ms: u64,
    /// Diagnostic message (block reason, spawn error, timeout note).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Result for a command rejected by the deny-list.
    pub fn blocked(command: impl Into<String>, timeout: Duration) -> Self {
        let command = command.into();
        Self {
            message: Some(format!("dangerous command detected: {command}")),
            command,
            outcome: Outcome::Blocked,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Result for a process that could not be created.
    pub fn spawn_error(
        command: impl Into<String>,
        timeout: Duration,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            outcome: Outcome::SpawnError,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: elapsed.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Runtime used to execute a script artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Interpreter {
    #[default]
    Python,
    Bash,
    Sh,
    /// Any other program, invoked as `<program> <script>`.
    Other(String),
}

impl Interpreter {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Python => "python",
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Other(program) => program,
        }
    }

    /// File extension used for materialized artifacts (without the dot).
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Bash | Self::Sh => "sh",
            Self::Other(_) => "script",
        }
    }

    /// Program to invoke. Python resolves to the configured binary.
    pub fn program(&self, python_bin: &str) -> String {
        match self {
            Self::Python => python_bin.to_string(),
            other => other.as_str().to_string(),
        }
    }

    /// Infer the interpreter from a script's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "bash" => Some(Self::Bash),
            "sh" => Some(Self::Sh),
            _ => None,
        }
    }
}

impl From<String> for Interpreter {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "python" | "python3" | "py" => Self::Python,
            "bash" => Self::Bash,
            "sh" => Self::Sh,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Interpreter {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Interpreter> for String {
    fn from(value: Interpreter) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Tasks and queue ---

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// A task document, stored at `<ns>/task_memory/task_<id>.json`.
///
/// Fields other collaborators attach (reflection, scoring metrics, prompts)
/// are kept in `extra` and survive a load/save round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Id,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub interpreter: Interpreter,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(Id::new(), title)
    }

    pub fn with_id(id: Id, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            difficulty: None,
            source: None,
            interpreter: Interpreter::default(),
            created_at: Utc::now(),
            updated_at: None,
            result: None,
            extra: Map::new(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn difficulty(mut self, difficulty: f64) -> Self {
        self.difficulty = Some(difficulty);
        self
    }
}

/// One pending unit of work in the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task: TaskRecord,
    /// Smaller is more urgent.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed executions already retried.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl QueueEntry {
    pub fn new(task: TaskRecord, priority: i32) -> Self {
        let max_attempts = task.max_attempts;
        Self {
            task,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_attempts,
        }
    }

    /// Whether one more attempt fits in the budget after the current one failed.
    pub fn can_retry(&self) -> bool {
        self.retry_count.saturating_add(1) < self.max_attempts
    }

    pub fn task_id(&self) -> &Id {
        &self.task.id
    }
}

/// Persisted shape of the queue document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
}

// --- Ledger records ---

fn default_difficulty() -> f64 {
    0.5
}

fn default_source() -> String {
    "unknown".to_string()
}

/// One line of the score log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub task_id: Id,
    pub score: f64,
    #[serde(default = "default_difficulty")]
    pub difficulty: f64,
    #[serde(default = "default_source")]
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl ScoreEntry {
    pub fn for_task(task: &TaskRecord, score: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            score,
            difficulty: task.difficulty.unwrap_or_else(default_difficulty),
            source: task.source.clone().unwrap_or_else(default_source),
            timestamp: Utc::now(),
            metrics: None,
        }
    }
}

/// Aggregate view of the builder's track record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderProfile {
    pub id: String,
    #[serde(default)]
    pub task_count: u64,
    #[serde(default)]
    pub average_score: f64,
    #[serde(default)]
    pub skills_mastered: Vec<String>,
    #[serde(default)]
    pub weak_skills: Vec<String>,
    #[serde(default)]
    pub style_flags: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl Default for BuilderProfile {
    fn default() -> Self {
        Self {
            id: "builder_v0.1".to_string(),
            task_count: 0,
            average_score: 0.0,
            skills_mastered: Vec::new(),
            weak_skills: Vec::new(),
            style_flags: Map::new(),
            last_updated: Utc::now(),
        }
    }
}

impl BuilderProfile {
    /// Count one more task and fold its score into the running average.
    pub fn record_task(&mut self, score: Option<f64>) {
        self.task_count += 1;
        if let Some(score) = score {
            let count = self.task_count as f64;
            self.average_score = (self.average_score * (count - 1.0) + score) / count;
        }
        self.last_updated = Utc::now();
    }
}

/// Severity of a system log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One entry of the persisted system log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Bookkeeping row written for every archived artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub task_id: Id,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub interpreter: Interpreter,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_serializes_with_exit_code() {
        let value = serde_json::to_value(Outcome::NonZeroExit(2)).unwrap();
        assert_eq!(value, json!({"kind": "non_zero_exit", "exit_code": 2}));

        let value = serde_json::to_value(Outcome::TimedOut).unwrap();
        assert_eq!(value, json!({"kind": "timed_out"}));
    }

    #[test]
    fn outcome_exit_code_only_for_completed_runs() {
        assert_eq!(Outcome::Success.exit_code(), Some(0));
        assert_eq!(Outcome::NonZeroExit(3).exit_code(), Some(3));
        assert_eq!(Outcome::TimedOut.exit_code(), None);
        assert_eq!(Outcome::Blocked.exit_code(), None);
    }

    #[test]
    fn blocked_result_names_the_command() {
        let result = ExecutionResult::blocked("rm -rf /", Duration::from_secs(5));
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!(result.timeout_ms, 5000);
        assert!(result.message.unwrap().contains("rm -rf /"));
    }

    #[test]
    fn interpreter_parses_and_serializes_as_string() {
        assert_eq!(Interpreter::from("python3"), Interpreter::Python);
        assert_eq!(Interpreter::from("BASH"), Interpreter::Bash);
        assert_eq!(
            Interpreter::from("node"),
            Interpreter::Other("node".to_string())
        );

        let value = serde_json::to_value(Interpreter::Other("ruby".into())).unwrap();
        assert_eq!(value, json!("ruby"));
        let back: Interpreter = serde_json::from_value(json!("sh")).unwrap();
        assert_eq!(back, Interpreter::Sh);
    }

    #[test]
    fn interpreter_from_path_uses_extension() {
        assert_eq!(
            Interpreter::from_path(Path::new("a/b/run.py")),
            Some(Interpreter::Python)
        );
        assert_eq!(
            Interpreter::from_path(Path::new("build.bash")),
            Some(Interpreter::Bash)
        );
        assert_eq!(Interpreter::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn task_record_keeps_unknown_fields() {
        let raw = json!({
            "id": "task-1",
            "title": "sum two numbers",
            "reflection": {"notes": "ok"},
        });
        let task: TaskRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(task.id, Id::from_string("task-1"));
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.extra["reflection"]["notes"], "ok");

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["reflection"]["notes"], "ok");
    }

    #[test]
    fn queue_entry_retry_budget() {
        let task = TaskRecord::new("t").max_attempts(3);
        let mut entry = QueueEntry::new(task, 10);
        assert_eq!(entry.max_attempts, 3);
        assert!(entry.can_retry());
        entry.retry_count = 1;
        assert!(entry.can_retry());
        entry.retry_count = 2;
        assert!(!entry.can_retry());
    }

    #[test]
    fn profile_running_average() {
        let mut profile = BuilderProfile::default();
        profile.record_task(Some(0.5));
        profile.record_task(Some(1.0));
        profile.record_task(None);
        assert_eq!(profile.task_count, 3);
        assert!((profile.average_score - 0.75).abs() < f64::EPSILON);
    }
}
