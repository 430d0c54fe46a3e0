//! Priority task queue persisted as one store document.
//!
//! The document has the shape `{"queue": [QueueEntry, ...]}`. Lower priority
//! values are served first; equal priorities are served in insertion order.

use cogloop_core::events::SharedSink;
use cogloop_core::{Event, QueueDocument, QueueEntry, TaskRecord, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::store::{DurableStore, StoreError};

/// Priority given to a retried task unless its own priority is already lower.
pub const DEFAULT_RETRY_PRIORITY: i32 = 5;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// What happened to an entry after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Requeued { priority: i32, retry_count: u32 },
    Dropped { attempts: u32 },
}

/// Durable priority queue of tasks.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: DurableStore,
    key: String,
    retry_priority: i32,
    sink: SharedSink,
}

impl TaskQueue {
    pub fn new(store: DurableStore, key: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            store,
            key: key.into(),
            retry_priority: DEFAULT_RETRY_PRIORITY,
            sink,
        }
    }

    pub fn retry_priority(mut self, priority: i32) -> Self {
        self.retry_priority = priority;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn load(&self) -> Result<QueueDocument> {
        Ok(self.store.load_as_or_default(&self.key)?)
    }

    fn save(&self, document: &QueueDocument) -> Result<()> {
        Ok(self.store.save_as(&self.key, document)?)
    }

    /// Stable sort, then pop the most urgent entry.
    fn pop_front(document: &mut QueueDocument) -> Option<QueueEntry> {
        document.queue.sort_by_key(|entry| entry.priority);
        if document.queue.is_empty() {
            None
        } else {
            Some(document.queue.remove(0))
        }
    }

    /// Add a task with the given priority.
    pub fn enqueue(&self, task: TaskRecord, priority: i32) -> Result<QueueEntry> {
        let mut task = task;
        task.status = TaskStatus::Queued;
        self.push(QueueEntry::new(task, priority))
    }

    fn push(&self, entry: QueueEntry) -> Result<QueueEntry> {
        let mut document = self.load()?;
        document.queue.push(entry.clone());
        self.save(&document)?;

        self.sink.emit(Event::TaskEnqueued {
            task_id: entry.task_id().clone(),
            priority: entry.priority,
            retry_count: entry.retry_count,
        });
        Ok(entry)
    }

    /// Remove and return the most urgent entry.
    ///
    /// Only the final save is locked, so two processes dequeuing at the same
    /// moment can both receive the same entry. Use [`Self::dequeue_exclusive`]
    /// when several consumers share one queue.
    pub fn dequeue(&self) -> Result<Option<QueueEntry>> {
        let mut document = self.load()?;
        let Some(entry) = Self::pop_front(&mut document) else {
            return Ok(None);
        };
        self.save(&document)?;
        self.emit_dequeued(&entry, document.queue.len());
        Ok(Some(entry))
    }

    /// Like [`Self::dequeue`], holding the exclusive lock across load, pop
    /// and save.
    pub fn dequeue_exclusive(&self) -> Result<Option<QueueEntry>> {
        let popped = self
            .store
            .modify(&self.key, json!({"queue": []}), |value| {
                let mut document: QueueDocument = DurableStore::decode(&self.key, value.take())?;
                let entry = Self::pop_front(&mut document);
                *value = DurableStore::encode(&self.key, &document)?;
                Ok(entry.map(|entry| (entry, document.queue.len())))
            })?;

        Ok(popped.map(|(entry, remaining)| {
            self.emit_dequeued(&entry, remaining);
            entry
        }))
    }

    fn emit_dequeued(&self, entry: &QueueEntry, remaining: usize) {
        self.sink.emit(Event::TaskDequeued {
            task_id: entry.task_id().clone(),
            priority: entry.priority,
            remaining,
        });
    }

    /// Re-enqueue a failed entry if it has attempts left, otherwise drop it.
    pub fn requeue_on_failure(&self, entry: QueueEntry) -> Result<Disposition> {
        if !entry.can_retry() {
            let attempts = entry.retry_count + 1;
            debug!(task_id = %entry.task_id(), attempts, "retry budget exhausted");
            self.sink.emit(Event::TaskDropped {
                task_id: entry.task_id().clone(),
                attempts,
            });
            return Ok(Disposition::Dropped { attempts });
        }

        let priority = entry.priority.min(self.retry_priority);
        let retry_count = entry.retry_count + 1;
        let mut retried = QueueEntry::new(entry.task, priority);
        retried.retry_count = retry_count;
        retried.max_attempts = entry.max_attempts;
        retried.task.status = TaskStatus::Queued;

        let retried = self.push(retried)?;
        self.sink.emit(Event::TaskRequeued {
            task_id: retried.task_id().clone(),
            priority,
            retry_count,
            max_attempts: retried.max_attempts,
        });
        Ok(Disposition::Requeued {
            priority,
            retry_count,
        })
    }

    /// Entries in the order they would be dequeued.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let mut document = self.load()?;
        document.queue.sort_by_key(|entry| entry.priority);
        Ok(document.queue)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.queue.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&QueueDocument::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogloop_core::{EventType, Id, MemorySink, StoreKeys};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn queue() -> (TempDir, TaskQueue, Arc<MemorySink>) {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let store = DurableStore::new(dir.path(), sink.clone());
        let queue = TaskQueue::new(store, StoreKeys::default().queue(), sink.clone());
        (dir, queue, sink)
    }

    fn task(id: &str) -> TaskRecord {
        TaskRecord::with_id(Id::from_string(id), id)
    }

    fn drain_ids(queue: &TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue().unwrap())
            .map(|entry| entry.task.id.to_string())
            .collect()
    }

    #[test]
    fn dequeues_in_priority_order() {
        let (_dir, queue, sink) = queue();
        queue.enqueue(task("p5"), 5).unwrap();
        queue.enqueue(task("p1"), 1).unwrap();
        queue.enqueue(task("p3"), 3).unwrap();

        assert_eq!(drain_ids(&queue), vec!["p1", "p3", "p5"]);
        assert_eq!(sink.count(EventType::TaskEnqueued), 3);
        assert_eq!(sink.count(EventType::TaskDequeued), 3);
    }

    #[test]
    fn equal_priorities_are_fifo() {
        let (_dir, queue, _) = queue();
        for id in ["a", "b", "c"] {
            queue.enqueue(task(id), 7).unwrap();
        }
        queue.enqueue(task("urgent"), 0).unwrap();

        assert_eq!(drain_ids(&queue), vec!["urgent", "a", "b", "c"]);
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let (_dir, queue, _) = queue();
        assert!(queue.dequeue().unwrap().is_none());
        assert!(queue.dequeue_exclusive().unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn enqueue_persists_entry_fields() {
        let (_dir, queue, _) = queue();
        let entry = queue.enqueue(task("t").max_attempts(4), 2).unwrap();
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.max_attempts, 4);
        assert_eq!(entry.task.status, TaskStatus::Queued);

        let stored = queue.entries().unwrap();
        assert_eq!(stored, vec![entry]);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn requeue_raises_priority_and_counts_retries() {
        let (_dir, queue, sink) = queue();
        queue.enqueue(task("t"), 10).unwrap();
        let entry = queue.dequeue().unwrap().unwrap();

        let disposition = queue.requeue_on_failure(entry).unwrap();
        assert_eq!(
            disposition,
            Disposition::Requeued {
                priority: DEFAULT_RETRY_PRIORITY,
                retry_count: 1
            }
        );

        let retried = queue.dequeue().unwrap().unwrap();
        assert_eq!(retried.priority, DEFAULT_RETRY_PRIORITY);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(sink.count(EventType::TaskRequeued), 1);
    }

    #[test]
    fn requeue_keeps_more_urgent_priority() {
        let (_dir, queue, _) = queue();
        queue.enqueue(task("t"), 1).unwrap();
        let entry = queue.dequeue().unwrap().unwrap();

        let disposition = queue.requeue_on_failure(entry).unwrap();
        assert!(matches!(disposition, Disposition::Requeued { priority: 1, .. }));
    }

    #[test]
    fn task_is_dropped_after_max_attempts() {
        let (_dir, queue, sink) = queue();
        queue.enqueue(task("flaky").max_attempts(3), 10).unwrap();

        let mut dispositions = Vec::new();
        while let Some(entry) = queue.dequeue().unwrap() {
            dispositions.push(queue.requeue_on_failure(entry).unwrap());
        }

        assert_eq!(dispositions.len(), 3);
        assert_eq!(dispositions[2], Disposition::Dropped { attempts: 3 });
        assert!(queue.is_empty().unwrap());
        assert!(queue
            .entries()
            .unwrap()
            .iter()
            .all(|e| e.task.id.as_ref() != "flaky"));
        assert_eq!(sink.count(EventType::TaskDropped), 1);
    }

    #[test]
    fn single_attempt_tasks_are_never_retried() {
        let (_dir, queue, _) = queue();
        queue.enqueue(task("once").max_attempts(1), 3).unwrap();
        let entry = queue.dequeue().unwrap().unwrap();
        assert_eq!(
            queue.requeue_on_failure(entry).unwrap(),
            Disposition::Dropped { attempts: 1 }
        );
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn exclusive_dequeue_hands_out_each_entry_once() {
        let (_dir, queue, _) = queue();
        for i in 0..20 {
            queue.enqueue(task(&format!("t{i:02}")), i % 3).unwrap();
        }

        let mut taken: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = &queue;
                    scope.spawn(move || {
                        let mut ids = Vec::new();
                        while let Some(entry) = queue.dequeue_exclusive().unwrap() {
                            ids.push(entry.task.id.to_string());
                        }
                        ids
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        taken.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("t{i:02}")).collect();
        assert_eq!(taken, expected);
    }

    #[test]
    fn clear_empties_queue() {
        let (_dir, queue, _) = queue();
        queue.enqueue(task("a"), 1).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn unknown_task_fields_survive_queue_round_trip() {
        let (_dir, queue, _) = queue();
        let mut record = task("rich");
        record
            .extra
            .insert("reflection".into(), serde_json::json!({"notes": "keep"}));
        queue.enqueue(record, 1).unwrap();

        let entry = queue.dequeue().unwrap().unwrap();
        assert_eq!(entry.task.extra["reflection"]["notes"], "keep");
    }
}
