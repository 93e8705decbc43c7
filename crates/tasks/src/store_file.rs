//! JSON file-backed task store with atomic writes.
//!
//! Layout under the scheduler root: `triggers/<task_id>.json` holds the
//! configured trigger set, `history/<task_id>.json` the most recent
//! execution record.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
    tokio::fs,
};

use crate::{
    Result,
    error::{Context, Error},
    store::TaskStore,
    types::{ExecutionResult, TriggerDescriptor},
};

/// File-backed store. One JSON document per task and record family.
pub struct FileTaskStore {
    triggers_dir: PathBuf,
    history_dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            triggers_dir: root.join("triggers"),
            history_dir: root.join("history"),
        }
    }

    fn trigger_path(&self, task_id: &str) -> PathBuf {
        self.triggers_dir.join(format!("{task_id}.json"))
    }

    fn history_path(&self, task_id: &str) -> PathBuf {
        self.history_dir.join(format!("{task_id}.json"))
    }

    /// Atomic write: write to temp, rename over target, keep a `.bak`.
    async fn atomic_write(path: &Path, value: &impl Serialize) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, json.as_bytes()).await?;

        // Back up the previous record.
        if fs::try_exists(path).await.unwrap_or(false) {
            let bak = path.with_extension("json.bak");
            let _ = fs::rename(path, &bak).await;
        }

        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Read a record. Absent and empty files are both "no record"; anything
    /// unparseable surfaces as [`Error::PersistenceCorrupt`].
    async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let data = fs::read_to_string(path).await?;
        if data.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&data).map_err(|e| {
            Error::persistence_corrupt(path.display().to_string(), e.to_string())
        })?;
        Ok(Some(value))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load_triggers(&self, task_id: &str) -> Result<Option<Vec<TriggerDescriptor>>> {
        Self::read_record(&self.trigger_path(task_id)).await
    }

    async fn save_triggers(&self, task_id: &str, triggers: &[TriggerDescriptor]) -> Result<()> {
        Self::atomic_write(&self.trigger_path(task_id), &triggers).await
    }

    async fn load_last_result(&self, task_id: &str) -> Result<Option<ExecutionResult>> {
        Self::read_record(&self.history_path(task_id)).await
    }

    async fn save_last_result(&self, task_id: &str, result: &ExecutionResult) -> Result<()> {
        Self::atomic_write(&self.history_path(task_id), result).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::types::{CompletionStatus, DayOfWeek};

    fn result_for(task_id: &str) -> ExecutionResult {
        ExecutionResult {
            started_at_ms: 1000,
            finished_at_ms: 2000,
            status: CompletionStatus::Cancelled,
            name: "Extract chapter images".into(),
            id: task_id.into(),
            key: "chapter-images".into(),
            error_message: None,
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn triggers_roundtrip_field_for_field() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        let set = vec![
            TriggerDescriptor::daily(9 * 60 * 60 * 1000).with_max_runtime_ms(3_600_000),
            TriggerDescriptor::weekly(DayOfWeek::Saturday, 0),
            TriggerDescriptor::interval(15 * 60 * 1000),
            TriggerDescriptor::startup(),
        ];
        store.save_triggers("t1", &set).await.unwrap();
        assert_eq!(store.load_triggers("t1").await.unwrap(), Some(set));
    }

    #[tokio::test]
    async fn last_result_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        let result = result_for("t1");
        store.save_last_result("t1", &result).await.unwrap();
        assert_eq!(store.load_last_result("t1").await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn absent_files_are_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        assert!(store.load_triggers("missing").await.unwrap().is_none());
        assert!(store.load_last_result("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        fs::create_dir_all(tmp.path().join("history")).await.unwrap();
        fs::write(tmp.path().join("history/t1.json"), b"  \n")
            .await
            .unwrap();
        assert!(store.load_last_result("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_persistence_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        fs::create_dir_all(tmp.path().join("history")).await.unwrap();
        fs::write(tmp.path().join("history/t1.json"), b"{not json")
            .await
            .unwrap();
        let err = store.load_last_result("t1").await.unwrap_err();
        assert!(matches!(err, Error::PersistenceCorrupt { .. }));
    }

    #[tokio::test]
    async fn overwrite_keeps_a_backup() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        store.save_last_result("t1", &result_for("t1")).await.unwrap();
        let mut newer = result_for("t1");
        newer.status = CompletionStatus::Completed;
        store.save_last_result("t1", &newer).await.unwrap();

        assert_eq!(store.load_last_result("t1").await.unwrap(), Some(newer));
        assert!(tmp.path().join("history/t1.json.bak").exists());
    }

    #[tokio::test]
    async fn trigger_and_history_records_are_siblings() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path());
        store
            .save_triggers("t1", &[TriggerDescriptor::startup()])
            .await
            .unwrap();
        store.save_last_result("t1", &result_for("t1")).await.unwrap();
        assert!(tmp.path().join("triggers/t1.json").exists());
        assert!(tmp.path().join("history/t1.json").exists());
    }
}
