//! Bookkeeping documents: task records, score log, builder profile and the
//! persisted system log.

use chrono::Utc;
use cogloop_core::{
    BuilderProfile, ExecutionResult, Id, LogLevel, ScoreEntry, StoreKeys, SystemEvent, TaskRecord,
    TaskStatus,
};
use serde_json::Value;

use crate::store::{DurableStore, Result};

/// Writes execution outcomes and aggregate stats into the store.
#[derive(Debug, Clone)]
pub struct Ledger {
    store: DurableStore,
    keys: StoreKeys,
}

impl Ledger {
    pub fn new(store: DurableStore, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn load_task(&self, task_id: &Id) -> Result<TaskRecord> {
        self.store.load_as(&self.keys.task(task_id))
    }

    pub fn save_task(&self, task: &TaskRecord) -> Result<()> {
        self.store.save_as(&self.keys.task(&task.id), task)
    }

    /// Fold one execution result into the task's record, creating it if needed.
    pub fn record_result(&self, task_id: &Id, result: &ExecutionResult) -> Result<TaskRecord> {
        let mut task = match self.load_task(task_id) {
            Ok(task) => task,
            Err(err) if err.is_not_found() => TaskRecord::with_id(task_id.clone(), ""),
            Err(err) => return Err(err),
        };

        task.status = if result.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        task.attempts += 1;
        task.result = Some(result.clone());
        task.updated_at = Some(Utc::now());

        self.save_task(&task)?;
        Ok(task)
    }

    pub fn record_score(&self, entry: &ScoreEntry) -> Result<()> {
        let value = DurableStore::encode(&self.keys.score_log(), entry)?;
        self.store.append(&self.keys.score_log(), value)
    }

    pub fn load_builder_profile(&self) -> Result<BuilderProfile> {
        self.store.load_as_or_default(&self.keys.builder_profile())
    }

    /// Count one more task and fold `score` into the running average.
    pub fn update_builder_profile(&self, score: Option<f64>) -> Result<BuilderProfile> {
        let mut profile = self.load_builder_profile()?;
        profile.record_task(score);
        self.store.save_as(&self.keys.builder_profile(), &profile)?;
        Ok(profile)
    }

    pub fn log_system_event(
        &self,
        level: LogLevel,
        component: &str,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let event = SystemEvent {
            timestamp: Utc::now(),
            level,
            component: component.to_string(),
            message: message.to_string(),
            details,
        };
        let key = self.keys.system_log();
        let value = DurableStore::encode(&key, &event)?;
        self.store.append(&key, value)
    }

    pub fn system_events(&self) -> Result<Vec<SystemEvent>> {
        match self.store.load_as(&self.keys.system_log()) {
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }
}
