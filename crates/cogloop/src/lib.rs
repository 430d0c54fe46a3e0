//! cogloop - sandboxed execution engine
//!
//! Runs external processes and generated scripts under a timeout, persists
//! task state as JSON documents and schedules work through a priority queue.

pub mod ledger;
pub mod policy;
pub mod queue;
pub mod runner;
pub mod script;
pub mod store;

use cogloop_core::events::SharedSink;
use cogloop_core::{Config, ExecutionResult, LogLevel, QueueEntry, TaskRecord, TaskStatus};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use ledger::Ledger;
pub use policy::is_dangerous;
pub use queue::{Disposition, TaskQueue};
pub use runner::{CommandLine, Invocation, ProcessRunner, RunnerConfig};
pub use script::{FunctionRun, RunOptions, ScriptRun, ScriptRunner};
pub use store::DurableStore;

/// Component name used in system log entries.
const COMPONENT: &str = "engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Script(#[from] script::ScriptError),
    #[error("task {0} has no source to run")]
    MissingSource(cogloop_core::Id),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of running one queued task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub result: ExecutionResult,
    pub archive_path: PathBuf,
    /// Set when the execution failed.
    pub disposition: Option<Disposition>,
}

/// Engine state: every component wired to one config and one event sink.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Config,
    store: DurableStore,
    queue: TaskQueue,
    ledger: Ledger,
    scripts: ScriptRunner,
}

impl Engine {
    pub fn new(config: Config, sink: SharedSink) -> Self {
        let keys = config.keys();
        let store = DurableStore::new(&config.store_root, Arc::clone(&sink));
        let queue = TaskQueue::new(store.clone(), keys.queue(), Arc::clone(&sink))
            .retry_priority(config.retry_priority);
        let ledger = Ledger::new(store.clone(), keys.clone());
        let runner = ProcessRunner::from_config(&config, Arc::clone(&sink));
        let scripts =
            ScriptRunner::from_config(&config, runner, sink).with_index(store.clone(), keys);

        Self {
            config,
            store,
            queue,
            ledger,
            scripts,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn scripts(&self) -> &ScriptRunner {
        &self.scripts
    }

    pub fn runner(&self) -> &ProcessRunner {
        self.scripts.process_runner()
    }

    /// Persist a task record and queue it (default priority when `None`).
    pub fn submit(&self, task: TaskRecord, priority: Option<i32>) -> Result<QueueEntry> {
        let priority = priority.unwrap_or(self.config.default_priority);
        let mut task = task;
        task.status = TaskStatus::Queued;
        self.ledger.save_task(&task)?;
        Ok(self.queue.enqueue(task, priority)?)
    }

    /// Dequeue the most urgent task and run the source stored on it.
    pub async fn run_next(&self) -> Result<Option<TaskRun>> {
        let Some(entry) = self.queue.dequeue_exclusive()? else {
            return Ok(None);
        };
        let Some(source) = entry.task.source.clone() else {
            let task_id = entry.task_id().clone();
            self.log_event(LogLevel::Error, "task has no source", json!({"task_id": task_id}));
            self.queue.requeue_on_failure(entry)?;
            return Err(EngineError::MissingSource(task_id));
        };
        self.run_task(entry, &source).await.map(Some)
    }

    /// Run `source` for a dequeued entry.
    ///
    /// Marks the task running, archives the source, executes it from an
    /// ephemeral artifact and records the result. A failed execution goes
    /// back through [`TaskQueue::requeue_on_failure`], and so does an entry
    /// whose run could not finish (archive, store or runner fault).
    pub async fn run_task(&self, entry: QueueEntry, source: &str) -> Result<TaskRun> {
        let task_id = entry.task_id().clone();
        info!(
            task_id = %task_id,
            priority = entry.priority,
            retry_count = entry.retry_count,
            "running task"
        );

        let (result, archive_path) = match self.attempt(&entry, source).await {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "task failed before completion");
                self.log_event(
                    LogLevel::Error,
                    "execution error",
                    json!({"task_id": task_id, "error": err.to_string()}),
                );
                self.release_failed(entry);
                return Err(err);
            }
        };

        let disposition = if result.is_success() {
            None
        } else {
            Some(self.queue.requeue_on_failure(entry)?)
        };

        let (level, message) = if result.is_success() {
            (LogLevel::Info, "task completed")
        } else {
            (LogLevel::Warning, "task failed")
        };
        self.log_event(
            level,
            message,
            json!({
                "task_id": task_id,
                "outcome": result.outcome,
                "duration_ms": result.duration_ms,
                "archive_path": archive_path,
                "disposition": disposition,
            }),
        );

        Ok(TaskRun {
            result,
            archive_path,
            disposition,
        })
    }

    /// Mark running, archive, execute and record one attempt.
    async fn attempt(
        &self,
        entry: &QueueEntry,
        source: &str,
    ) -> Result<(ExecutionResult, PathBuf)> {
        let task_id = entry.task_id();
        let mut task = match self.ledger.load_task(task_id) {
            Ok(task) => task,
            Err(err) if err.is_not_found() => entry.task.clone(),
            Err(err) => return Err(err.into()),
        };
        task.status = TaskStatus::Running;
        task.source = Some(source.to_string());
        task.updated_at = Some(chrono::Utc::now());
        self.ledger.save_task(&task)?;

        let file_name = format!("code.{}", task.interpreter.extension());
        let archive_path = self
            .scripts
            .archive(source, task_id, &file_name, &task.interpreter)?;

        let run = self
            .scripts
            .run_source(
                source,
                &task.interpreter,
                self.config.exec_timeout(),
                &RunOptions::default(),
            )
            .await?;

        self.ledger.record_result(task_id, &run.result)?;
        Ok((run.result, archive_path))
    }

    /// Requeue an entry whose attempt errored and reset its record's status.
    ///
    /// Errors here are logged, not returned: the caller reports the fault
    /// that got us here.
    fn release_failed(&self, entry: QueueEntry) {
        let task_id = entry.task_id().clone();
        let status = match self.queue.requeue_on_failure(entry) {
            Ok(Disposition::Requeued { .. }) => TaskStatus::Queued,
            Ok(Disposition::Dropped { .. }) => TaskStatus::Failed,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "failed to requeue task");
                TaskStatus::Failed
            }
        };
        let updated = self.ledger.load_task(&task_id).and_then(|mut task| {
            task.status = status;
            task.updated_at = Some(chrono::Utc::now());
            self.ledger.save_task(&task)
        });
        if let Err(err) = updated {
            warn!(task_id = %task_id, error = %err, "failed to update task status");
        }
    }

    /// Append to the persisted system log; failures only warn.
    fn log_event(&self, level: LogLevel, message: &str, details: serde_json::Value) {
        if let Err(err) = self
            .ledger
            .log_system_event(level, COMPONENT, message, Some(details))
        {
            warn!(error = %err, entry = message, "failed to write system log");
        }
    }
}
