//! Core data types for the scheduled-task engine.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One day, in milliseconds.
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Current time as epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable task id: truncated SHA-256 of the job's fully-qualified type name.
///
/// The id survives process restarts and is the join key between trigger
/// configuration and execution history on disk.
#[must_use]
pub fn derive_task_id(type_name: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Immutable identity of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Derived from the job's type name; see [`derive_task_id`].
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Grouping key that survives job renames.
    pub key: String,
}

/// When a trigger fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    /// Every day at a fixed local time.
    Daily,
    /// Once a week at a fixed weekday and local time.
    Weekly,
    /// On a fixed interval from the previous run.
    Interval,
    /// Once, immediately after application startup.
    Startup,
}

/// Day of week for weekly triggers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub(crate) fn to_chrono(self) -> chrono::Weekday {
        match self {
            Self::Monday => chrono::Weekday::Mon,
            Self::Tuesday => chrono::Weekday::Tue,
            Self::Wednesday => chrono::Weekday::Wed,
            Self::Thursday => chrono::Weekday::Thu,
            Self::Friday => chrono::Weekday::Fri,
            Self::Saturday => chrono::Weekday::Sat,
            Self::Sunday => chrono::Weekday::Sun,
        }
    }
}

/// Persisted configuration for a single trigger.
///
/// Kind-specific fields are optional at rest; [`TriggerDescriptor::validate`]
/// enforces their presence before a descriptor set is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    pub kind: TriggerKind,
    /// Offset since local midnight. Daily and Weekly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_of_day_ms: Option<u64>,
    /// Weekly only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<DayOfWeek>,
    /// Interval only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Cancellation deadline applied to executions this trigger starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
}

impl TriggerDescriptor {
    #[must_use]
    pub fn daily(time_of_day_ms: u64) -> Self {
        Self {
            kind: TriggerKind::Daily,
            time_of_day_ms: Some(time_of_day_ms),
            day_of_week: None,
            interval_ms: None,
            max_runtime_ms: None,
        }
    }

    #[must_use]
    pub fn weekly(day_of_week: DayOfWeek, time_of_day_ms: u64) -> Self {
        Self {
            kind: TriggerKind::Weekly,
            time_of_day_ms: Some(time_of_day_ms),
            day_of_week: Some(day_of_week),
            interval_ms: None,
            max_runtime_ms: None,
        }
    }

    #[must_use]
    pub fn interval(interval_ms: u64) -> Self {
        Self {
            kind: TriggerKind::Interval,
            time_of_day_ms: None,
            day_of_week: None,
            interval_ms: Some(interval_ms),
            max_runtime_ms: None,
        }
    }

    #[must_use]
    pub fn startup() -> Self {
        Self {
            kind: TriggerKind::Startup,
            time_of_day_ms: None,
            day_of_week: None,
            interval_ms: None,
            max_runtime_ms: None,
        }
    }

    #[must_use]
    pub fn with_max_runtime_ms(mut self, max_runtime_ms: u64) -> Self {
        self.max_runtime_ms = Some(max_runtime_ms);
        self
    }

    /// Check that the kind-specific required fields are present and sane.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            TriggerKind::Daily => {
                let tod = self.time_of_day_ms.ok_or_else(|| {
                    Error::invalid_configuration("daily trigger requires timeOfDayMs")
                })?;
                if tod >= DAY_MS {
                    return Err(Error::invalid_configuration(
                        "timeOfDayMs must be below 24 hours",
                    ));
                }
            },
            TriggerKind::Weekly => {
                let tod = self.time_of_day_ms.ok_or_else(|| {
                    Error::invalid_configuration("weekly trigger requires timeOfDayMs")
                })?;
                if tod >= DAY_MS {
                    return Err(Error::invalid_configuration(
                        "timeOfDayMs must be below 24 hours",
                    ));
                }
                if self.day_of_week.is_none() {
                    return Err(Error::invalid_configuration(
                        "weekly trigger requires dayOfWeek",
                    ));
                }
            },
            TriggerKind::Interval => {
                let interval = self.interval_ms.ok_or_else(|| {
                    Error::invalid_configuration("interval trigger requires intervalMs")
                })?;
                if interval == 0 {
                    return Err(Error::invalid_configuration("intervalMs must be > 0"));
                }
            },
            TriggerKind::Startup => {},
        }
        Ok(())
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CompletionStatus {
    Completed,
    Failed,
    /// The run observed an explicit cancellation request and stopped.
    Cancelled,
    /// The run was still active when shutdown gave up waiting for it.
    Aborted,
}

/// Record of a job's most recent completed run. One per job, overwritten
/// atomically on each completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub status: CompletionStatus,
    pub name: String,
    pub id: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Current execution status of a worker. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    /// Cancellation requested; the job has not yet observed it.
    Cancelling,
}

/// Options for one execution, carried over from the firing trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub max_runtime_ms: Option<u64>,
}

/// Lifecycle notifications re-published for status surfaces.
#[derive(Debug, Clone)]
pub enum TaskNotification {
    Queued { task_id: String },
    Executing { task_id: String },
    Progress { task_id: String, percent: f64 },
    Completed { task_id: String, result: ExecutionResult },
}

/// Callback for re-publishing task notifications.
pub type NotifyFn = Arc<dyn Fn(TaskNotification) + Send + Sync>;

/// Summary of the scheduler, in the shape the status surfaces consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub task_count: usize,
    pub running_count: usize,
    pub queued_count: usize,
}
