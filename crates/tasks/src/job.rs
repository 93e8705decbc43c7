//! The run contract between the scheduler and the job bodies it drives.

use std::fmt;

use {
    async_trait::async_trait,
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
};

use crate::types::TriggerDescriptor;

/// How a run ended, from the job body's point of view.
#[derive(Debug)]
pub enum JobError {
    /// The job observed the cancellation token and stopped early.
    Cancelled,
    /// The job hit an unexpected fault.
    Fault(anyhow::Error),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fault(err) => write!(f, "{err}"),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fault(err)
    }
}

/// Outcome of one job run.
pub type JobResult = Result<(), JobError>;

/// Progress sink handed to a running job.
///
/// Values are percentages. Anything above 100 is capped at the sink; values
/// below zero pass through untouched.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: watch::Sender<f64>,
}

impl ProgressReporter {
    pub(crate) fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx }, rx)
    }

    /// Report completion percentage.
    pub fn report(&self, percent: f64) {
        let _ = self.tx.send(percent.min(100.0));
    }
}

/// A schedulable unit of work.
///
/// Implementations are opaque to the scheduler: a library scan, a metadata
/// refresh, an image extraction pass. The obligations are to return promptly
/// once `cancel` is triggered and to report progress in `[0, 100]`.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    /// Display name, e.g. `"Scan media library"`.
    fn name(&self) -> &str;

    /// Longer operator-facing description.
    fn description(&self) -> &str {
        ""
    }

    /// Grouping category, e.g. `"Library"`.
    fn category(&self) -> &str;

    /// Stable grouping key for execution history; survives renames.
    fn key(&self) -> &str;

    /// Disabled jobs keep their triggers armed but skip fires.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Triggers used when no operator configuration is stored.
    fn default_triggers(&self) -> Vec<TriggerDescriptor> {
        Vec::new()
    }

    /// Execute the job.
    async fn run(&self, cancel: CancellationToken, progress: ProgressReporter) -> JobResult;
}
