//! In-memory store for testing.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Result,
    store::TaskStore,
    types::{ExecutionResult, TriggerDescriptor},
};

/// In-memory store backed by `HashMap`. No persistence — for tests only.
pub struct MemoryTaskStore {
    triggers: Mutex<HashMap<String, Vec<TriggerDescriptor>>>,
    results: Mutex<HashMap<String, ExecutionResult>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_triggers(&self, task_id: &str) -> Result<Option<Vec<TriggerDescriptor>>> {
        let triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(triggers.get(task_id).cloned())
    }

    async fn save_triggers(&self, task_id: &str, set: &[TriggerDescriptor]) -> Result<()> {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        triggers.insert(task_id.to_string(), set.to_vec());
        Ok(())
    }

    async fn load_last_result(&self, task_id: &str) -> Result<Option<ExecutionResult>> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        Ok(results.get(task_id).cloned())
    }

    async fn save_last_result(&self, task_id: &str, result: &ExecutionResult) -> Result<()> {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(task_id.to_string(), result.clone());
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompletionStatus, DAY_MS, DayOfWeek};

    fn result_for(task_id: &str) -> ExecutionResult {
        ExecutionResult {
            started_at_ms: 1000,
            finished_at_ms: 2000,
            status: CompletionStatus::Completed,
            name: "Refresh metadata".into(),
            id: task_id.into(),
            key: "metadata-refresh".into(),
            error_message: None,
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn triggers_roundtrip() {
        let store = MemoryTaskStore::new();
        let set = vec![
            TriggerDescriptor::daily(3 * 60 * 60 * 1000),
            TriggerDescriptor::weekly(DayOfWeek::Sunday, 0),
        ];
        store.save_triggers("t1", &set).await.unwrap();
        assert_eq!(store.load_triggers("t1").await.unwrap(), Some(set));
    }

    #[tokio::test]
    async fn absent_records_are_none() {
        let store = MemoryTaskStore::new();
        assert!(store.load_triggers("nope").await.unwrap().is_none());
        assert!(store.load_last_result("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_result_is_overwritten() {
        let store = MemoryTaskStore::new();
        store.save_last_result("t1", &result_for("t1")).await.unwrap();
        let mut newer = result_for("t1");
        newer.finished_at_ms = 9000;
        store.save_last_result("t1", &newer).await.unwrap();
        assert_eq!(store.load_last_result("t1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn save_replaces_the_whole_trigger_set() {
        let store = MemoryTaskStore::new();
        store
            .save_triggers("t1", &[TriggerDescriptor::daily(0), TriggerDescriptor::daily(1)])
            .await
            .unwrap();
        store
            .save_triggers("t1", &[TriggerDescriptor::interval(DAY_MS)])
            .await
            .unwrap();
        let loaded = store.load_triggers("t1").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
