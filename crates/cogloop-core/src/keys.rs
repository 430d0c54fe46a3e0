//! Store key conventions.
//!
//! Keys follow `<namespace>/<category>/<identifier>.json` and are resolved
//! against the store root by the store itself.

use crate::types::Id;

/// Default namespace for every document the loop writes.
pub const DEFAULT_NAMESPACE: &str = "memory";

/// Builds document keys under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = namespace.trim_matches('/').to_string();
        Self { namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, category: &str, identifier: &str) -> String {
        if self.namespace.is_empty() {
            format!("{category}/{identifier}.json")
        } else {
            format!("{}/{category}/{identifier}.json", self.namespace)
        }
    }

    pub fn task(&self, id: &Id) -> String {
        self.key("task_memory", &format!("task_{id}"))
    }

    pub fn queue(&self) -> String {
        self.key("task_memory", "task_queue")
    }

    pub fn score_log(&self) -> String {
        self.key("core", "score_log")
    }

    pub fn builder_profile(&self) -> String {
        self.key("core", "builder_profile")
    }

    pub fn system_log(&self) -> String {
        self.key("logs", "system_log")
    }

    pub fn archive_index(&self, task_id: &Id) -> String {
        self.key("code_archive/index", task_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keys_follow_layout() {
        let keys = StoreKeys::default();
        let id = Id::from_string("abc");
        assert_eq!(keys.task(&id), "memory/task_memory/task_abc.json");
        assert_eq!(keys.queue(), "memory/task_memory/task_queue.json");
        assert_eq!(keys.score_log(), "memory/core/score_log.json");
        assert_eq!(keys.builder_profile(), "memory/core/builder_profile.json");
        assert_eq!(keys.system_log(), "memory/logs/system_log.json");
        assert_eq!(
            keys.archive_index(&id),
            "memory/code_archive/index/abc.json"
        );
    }

    #[test]
    fn namespace_slashes_are_trimmed() {
        let keys = StoreKeys::new("/scratch/");
        assert_eq!(keys.queue(), "scratch/task_memory/task_queue.json");

        let bare = StoreKeys::new("");
        assert_eq!(bare.score_log(), "core/score_log.json");
    }
}
