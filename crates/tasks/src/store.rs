//! Persistence trait for trigger configuration and execution history.

use async_trait::async_trait;

use crate::{
    Result,
    types::{ExecutionResult, TriggerDescriptor},
};

/// Persistence backend for per-task trigger sets and last-run records.
///
/// The task id is the join key for both record families.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load the configured trigger set. `None` means nothing is stored and
    /// the job's built-in defaults apply.
    async fn load_triggers(&self, task_id: &str) -> Result<Option<Vec<TriggerDescriptor>>>;
    async fn save_triggers(&self, task_id: &str, triggers: &[TriggerDescriptor]) -> Result<()>;
    /// Load the most recent execution record. `None` means no history.
    async fn load_last_result(&self, task_id: &str) -> Result<Option<ExecutionResult>>;
    async fn save_last_result(&self, task_id: &str, result: &ExecutionResult) -> Result<()>;
}
