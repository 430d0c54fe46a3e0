//! Telemetry events emitted by the runner, the store and the queue.
//!
//! Components receive an [`EventSink`] at construction instead of reaching for
//! a global logger. [`TracingSink`] forwards to `tracing`; [`MemorySink`]
//! keeps events in memory so tests can assert on them.

use crate::types::Id;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    CommandBlocked,
    ExecutionStarted,
    ExecutionFinished,
    ArtifactArchived,
    DocumentSaved,
    TaskEnqueued,
    TaskDequeued,
    TaskRequeued,
    TaskDropped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandBlocked => "COMMAND_BLOCKED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ExecutionFinished => "EXECUTION_FINISHED",
            Self::ArtifactArchived => "ARTIFACT_ARCHIVED",
            Self::DocumentSaved => "DOCUMENT_SAVED",
            Self::TaskEnqueued => "TASK_ENQUEUED",
            Self::TaskDequeued => "TASK_DEQUEUED",
            Self::TaskRequeued => "TASK_REQUEUED",
            Self::TaskDropped => "TASK_DROPPED",
        }
    }
}

/// A telemetry event with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    CommandBlocked {
        command: String,
        rule: String,
    },
    ExecutionStarted {
        command: String,
        pid: Option<u32>,
        timeout_ms: u64,
    },
    ExecutionFinished {
        command: String,
        outcome: String,
        exit_code: Option<i32>,
        duration_ms: u64,
        stdout_bytes: usize,
        stderr_bytes: usize,
    },
    ArtifactArchived {
        task_id: Id,
        path: String,
        sha256: String,
    },
    DocumentSaved {
        key: String,
        bytes: usize,
    },
    TaskEnqueued {
        task_id: Id,
        priority: i32,
        retry_count: u32,
    },
    TaskDequeued {
        task_id: Id,
        priority: i32,
        remaining: usize,
    },
    TaskRequeued {
        task_id: Id,
        priority: i32,
        retry_count: u32,
        max_attempts: u32,
    },
    TaskDropped {
        task_id: Id,
        attempts: u32,
    },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CommandBlocked { .. } => EventType::CommandBlocked,
            Self::ExecutionStarted { .. } => EventType::ExecutionStarted,
            Self::ExecutionFinished { .. } => EventType::ExecutionFinished,
            Self::ArtifactArchived { .. } => EventType::ArtifactArchived,
            Self::DocumentSaved { .. } => EventType::DocumentSaved,
            Self::TaskEnqueued { .. } => EventType::TaskEnqueued,
            Self::TaskDequeued { .. } => EventType::TaskDequeued,
            Self::TaskRequeued { .. } => EventType::TaskRequeued,
            Self::TaskDropped { .. } => EventType::TaskDropped,
        }
    }
}

/// Destination for telemetry events.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: Event);
}

/// Shared handle to a sink, as held by components.
pub type SharedSink = Arc<dyn EventSink>;

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn shared() -> SharedSink {
        Arc::new(Self)
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::CommandBlocked { command, rule } => {
                warn!(command = %command, rule = %rule, "dangerous command blocked");
            }
            Event::ExecutionStarted {
                command,
                pid,
                timeout_ms,
            } => {
                debug!(command = %command, pid = ?pid, timeout_ms, "process spawned");
            }
            Event::ExecutionFinished {
                command,
                outcome,
                exit_code,
                duration_ms,
                stdout_bytes,
                stderr_bytes,
            } => {
                if outcome == "success" {
                    info!(
                        command = %command,
                        exit_code = ?exit_code,
                        duration_ms,
                        stdout_bytes,
                        stderr_bytes,
                        "command completed"
                    );
                } else {
                    warn!(
                        command = %command,
                        outcome = %outcome,
                        exit_code = ?exit_code,
                        duration_ms,
                        stdout_bytes,
                        stderr_bytes,
                        "command did not succeed"
                    );
                }
            }
            Event::ArtifactArchived {
                task_id,
                path,
                sha256,
            } => {
                info!(task_id = %task_id, path = %path, sha256 = %sha256, "archived artifact");
            }
            Event::DocumentSaved { key, bytes } => {
                debug!(key = %key, bytes, "saved document");
            }
            Event::TaskEnqueued {
                task_id,
                priority,
                retry_count,
            } => {
                info!(task_id = %task_id, priority, retry_count, "task enqueued");
            }
            Event::TaskDequeued {
                task_id,
                priority,
                remaining,
            } => {
                info!(task_id = %task_id, priority, remaining, "task dequeued");
            }
            Event::TaskRequeued {
                task_id,
                priority,
                retry_count,
                max_attempts,
            } => {
                info!(
                    task_id = %task_id,
                    priority,
                    retry_count,
                    max_attempts,
                    "requeued failed task"
                );
            }
            Event::TaskDropped { task_id, attempts } => {
                warn!(task_id = %task_id, attempts, "task exhausted its attempts; dropped");
            }
        }
    }
}

/// Records every event in order. Intended for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events of the given type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
