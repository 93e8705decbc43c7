//! Per-job worker: owns triggers, execution state, progress, and history.
//!
//! A worker never runs two executions at once. Cross-job concurrency is the
//! manager's concern; the worker only reports to it and asks it to queue
//! work when a trigger fires.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use {
    tokio::{
        sync::{Mutex, mpsc, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    error::{Error, Result},
    job::{JobError, ProgressReporter, ScheduledJob},
    manager::TaskCoordinator,
    store::TaskStore,
    trigger::{RuntimeTrigger, TriggerFired},
    types::{
        CompletionStatus, ExecutionResult, JobDescriptor, RunOptions, RunState, TriggerDescriptor,
        now_ms,
    },
};

/// Pause between a trigger firing and re-arming it, so a zero-delay trigger
/// cannot enqueue the same task twice before the manager starts it.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// One in-flight execution.
struct ActiveRun {
    cancel: CancellationToken,
    started_at_ms: u64,
    progress: watch::Receiver<f64>,
    /// Timer that requests cancellation at the max-runtime deadline.
    deadline: Option<JoinHandle<()>>,
}

/// Trigger set, run slot, and history cache, guarded as one region so the
/// cache and the corresponding store write never go out of sync.
struct WorkerState {
    triggers: Vec<RuntimeTrigger>,
    /// Bumped on every trigger replacement; stale fires are inert.
    generation: u64,
    run: Option<ActiveRun>,
    /// `None` until the first load; `Some(None)` after loading empty history.
    last_result: Option<Option<ExecutionResult>>,
}

impl WorkerState {
    fn run_state(&self) -> RunState {
        match &self.run {
            None => RunState::Idle,
            Some(run) if run.cancel.is_cancelled() => RunState::Cancelling,
            Some(_) => RunState::Running,
        }
    }
}

/// Drives one registered job: arms its triggers, executes it on the
/// manager's request, and keeps its most recent execution record.
pub struct TaskWorker {
    descriptor: JobDescriptor,
    job: Arc<dyn ScheduledJob>,
    store: Arc<dyn TaskStore>,
    coordinator: Weak<dyn TaskCoordinator>,
    state: Mutex<WorkerState>,
    fire_tx: mpsc::Sender<TriggerFired>,
    /// `true` while a run is in flight; teardown waits on this.
    run_active: watch::Sender<bool>,
}

impl TaskWorker {
    pub(crate) fn new(
        descriptor: JobDescriptor,
        job: Arc<dyn ScheduledJob>,
        store: Arc<dyn TaskStore>,
        coordinator: Weak<dyn TaskCoordinator>,
    ) -> Arc<Self> {
        let (fire_tx, mut fire_rx) = mpsc::channel(16);
        let (run_active, _) = watch::channel(false);
        let worker = Arc::new(Self {
            descriptor,
            job,
            store,
            coordinator,
            state: Mutex::new(WorkerState {
                triggers: Vec::new(),
                generation: 0,
                run: None,
                last_result: None,
            }),
            fire_tx,
            run_active,
        });

        // Dispatch loop: consumes fire notifications from this worker's
        // triggers. Exits once the worker is dropped (all senders abort).
        let weak = Arc::downgrade(&worker);
        tokio::spawn(async move {
            while let Some(fired) = fire_rx.recv().await {
                let Some(worker) = weak.upgrade() else { break };
                worker.handle_trigger_fired(fired).await;
            }
        });

        worker
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn job(&self) -> &Arc<dyn ScheduledJob> {
        &self.job
    }

    pub async fn run_state(&self) -> RunState {
        self.state.lock().await.run_state()
    }

    /// Progress of the in-flight run, if any.
    pub async fn current_progress(&self) -> Option<f64> {
        let state = self.state.lock().await;
        state.run.as_ref().map(|run| *run.progress.borrow())
    }

    /// The configured trigger descriptors, in order.
    pub async fn triggers(&self) -> Vec<TriggerDescriptor> {
        let state = self.state.lock().await;
        state
            .triggers
            .iter()
            .map(|t| t.descriptor().clone())
            .collect()
    }

    /// Replace the full trigger set: validate, persist, dispose the old
    /// runtime triggers, arm the new ones. All-or-nothing — a validation or
    /// persistence failure leaves the existing triggers untouched.
    pub async fn set_triggers(&self, descriptors: Vec<TriggerDescriptor>) -> Result<()> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }
        let mut state = self.state.lock().await;
        self.store
            .save_triggers(&self.descriptor.id, &descriptors)
            .await?;
        let last = self.load_last_result_locked(&mut state).await;
        self.replace_triggers_locked(&mut state, descriptors, false, last.as_ref())
    }

    /// Arm a trigger set that came from storage or from the job's defaults.
    /// Does not persist; `is_startup` enables the catch-up policy.
    pub(crate) async fn arm_triggers(
        &self,
        descriptors: Vec<TriggerDescriptor>,
        is_startup: bool,
    ) -> Result<()> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }
        let mut state = self.state.lock().await;
        let last = self.load_last_result_locked(&mut state).await;
        self.replace_triggers_locked(&mut state, descriptors, is_startup, last.as_ref())
    }

    fn replace_triggers_locked(
        &self,
        state: &mut WorkerState,
        descriptors: Vec<TriggerDescriptor>,
        is_startup: bool,
        last: Option<&ExecutionResult>,
    ) -> Result<()> {
        for trigger in &mut state.triggers {
            trigger.stop();
        }
        state.generation += 1;
        let generation = state.generation;
        state.triggers = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| RuntimeTrigger::new(descriptor, index))
            .collect();
        for trigger in &mut state.triggers {
            trigger.start(last, is_startup, generation, self.fire_tx.clone())?;
        }
        Ok(())
    }

    /// The most recent execution record, loaded lazily and cached.
    ///
    /// Missing history and corrupt records both read as `None`; corruption is
    /// logged but never blocks future scheduling.
    pub async fn last_execution_result(&self) -> Option<ExecutionResult> {
        let mut state = self.state.lock().await;
        self.load_last_result_locked(&mut state).await
    }

    async fn load_last_result_locked(&self, state: &mut WorkerState) -> Option<ExecutionResult> {
        if let Some(cached) = &state.last_result {
            return cached.clone();
        }
        let loaded = match self.store.load_last_result(&self.descriptor.id).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    task = %self.descriptor.name,
                    error = %err,
                    "unreadable execution history, treating as absent"
                );
                None
            },
        };
        state.last_result = Some(loaded.clone());
        loaded
    }

    /// Execute the job. Invoked by the manager once a queue slot frees up.
    ///
    /// Fails fast with [`Error::AlreadyRunning`] when a run is in flight.
    /// The job body runs on its own task, so a panicking job is recorded as
    /// a failure rather than tearing the caller down.
    pub async fn execute(&self, options: RunOptions) -> Result<ExecutionResult> {
        let (cancel, reporter, progress_rx, started_at_ms) = {
            let mut state = self.state.lock().await;
            if state.run.is_some() {
                return Err(Error::already_running(&self.descriptor.name));
            }
            let cancel = CancellationToken::new();
            let (reporter, progress_rx) = ProgressReporter::channel();
            let started_at_ms = now_ms();
            let deadline = options.max_runtime_ms.map(|max_runtime_ms| {
                let token = cancel.clone();
                let name = self.descriptor.name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(max_runtime_ms)).await;
                    info!(task = %name, "max runtime reached, requesting cancellation");
                    token.cancel();
                })
            });
            state.run = Some(ActiveRun {
                cancel: cancel.clone(),
                started_at_ms,
                progress: progress_rx.clone(),
                deadline,
            });
            (cancel, reporter, progress_rx, started_at_ms)
        };
        let _ = self.run_active.send(true);

        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_executing(&self.descriptor.id);
        }
        info!(task = %self.descriptor.name, "task started");

        // Re-publish clamped progress updates for the lifetime of the run.
        {
            let coordinator = self.coordinator.clone();
            let task_id = self.descriptor.id.clone();
            let mut rx = progress_rx;
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let percent = *rx.borrow_and_update();
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.on_progress(&task_id, percent);
                    }
                }
            });
        }

        let job = Arc::clone(&self.job);
        let run_cancel = cancel.clone();
        let joined = tokio::spawn(async move { job.run(run_cancel, reporter).await }).await;

        let finished_at_ms = now_ms().max(started_at_ms);
        let (status, error_message, error_detail) = match joined {
            Ok(Ok(())) => (CompletionStatus::Completed, None, None),
            Ok(Err(JobError::Cancelled)) => {
                info!(task = %self.descriptor.name, "task cancelled");
                (CompletionStatus::Cancelled, None, None)
            },
            Ok(Err(JobError::Fault(err))) => {
                error!(task = %self.descriptor.name, error = %err, "task failed");
                (
                    CompletionStatus::Failed,
                    Some(err.to_string()),
                    Some(format!("{err:?}")),
                )
            },
            Err(join_err) => {
                error!(task = %self.descriptor.name, error = %join_err, "task body panicked");
                (
                    CompletionStatus::Failed,
                    Some("task body panicked".to_string()),
                    Some(join_err.to_string()),
                )
            },
        };

        let result = ExecutionResult {
            started_at_ms,
            finished_at_ms,
            status,
            name: self.descriptor.name.clone(),
            id: self.descriptor.id.clone(),
            key: self.descriptor.key.clone(),
            error_message,
            error_detail,
        };

        // Back to idle first; the cache and the record write share the lock
        // so a reader never observes one without the other.
        {
            let mut state = self.state.lock().await;
            if let Some(run) = state.run.take()
                && let Some(deadline) = run.deadline
            {
                deadline.abort();
            }
            state.last_result = Some(Some(result.clone()));
            if let Err(err) = self
                .store
                .save_last_result(&self.descriptor.id, &result)
                .await
            {
                warn!(
                    task = %self.descriptor.name,
                    error = %err,
                    "failed to persist execution result"
                );
            }
        }
        let _ = self.run_active.send(false);

        info!(task = %self.descriptor.name, status = ?status, "task finished");
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_completed(&self.descriptor.id, &result);
        }
        Ok(result)
    }

    /// Request cancellation of the in-flight run.
    ///
    /// Cancellation is cooperative: this marks the token and the run state
    /// becomes Cancelling until the job observes it and exits.
    pub async fn cancel(&self) -> Result<()> {
        let state = self.state.lock().await;
        match &state.run {
            Some(run) if !run.cancel.is_cancelled() => {
                info!(task = %self.descriptor.name, "cancellation requested");
                run.cancel.cancel();
                Ok(())
            },
            _ => Err(Error::not_running(&self.descriptor.name)),
        }
    }

    /// Like [`TaskWorker::cancel`] but silent when nothing is running; used
    /// during shutdown where racing a natural completion is expected.
    pub async fn cancel_if_running(&self) {
        let state = self.state.lock().await;
        if let Some(run) = &state.run
            && !run.cancel.is_cancelled()
        {
            info!(task = %self.descriptor.name, "cancellation requested");
            run.cancel.cancel();
        }
    }

    async fn handle_trigger_fired(&self, fired: TriggerFired) {
        {
            let state = self.state.lock().await;
            if fired.generation != state.generation || fired.index >= state.triggers.len() {
                return;
            }
        }

        if !self.job.is_enabled() {
            debug!(task = %self.descriptor.name, "trigger fired for disabled task, ignoring");
            return;
        }

        let options = {
            let mut state = self.state.lock().await;
            if fired.generation != state.generation {
                return;
            }
            let trigger = &mut state.triggers[fired.index];
            trigger.stop();
            RunOptions {
                max_runtime_ms: trigger.descriptor().max_runtime_ms,
            }
        };

        info!(task = %self.descriptor.name, "trigger fired, requesting execution");
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.enqueue(&self.descriptor.id, options);
        }

        // Give the manager a moment to pick the request up before re-arming,
        // so a zero-delay trigger cannot enqueue the same task twice.
        tokio::time::sleep(SETTLE_DELAY).await;

        let mut state = self.state.lock().await;
        if fired.generation != state.generation || fired.index >= state.triggers.len() {
            return;
        }
        let last = self.load_last_result_locked(&mut state).await;
        let generation = state.generation;
        let fire_tx = self.fire_tx.clone();
        if let Err(err) = state.triggers[fired.index].start(last.as_ref(), false, generation, fire_tx)
        {
            warn!(task = %self.descriptor.name, error = %err, "failed to re-arm trigger");
        }
    }

    /// Stop all triggers and wind down any in-flight run.
    ///
    /// Waits up to `grace` for a cancelled run to exit on its own; past that
    /// the run is recorded as Aborted, distinct from an acknowledged
    /// cancellation.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            state.generation += 1; // in-flight fire notifications become inert
            for trigger in &mut state.triggers {
                trigger.stop();
            }
        }
        self.cancel_if_running().await;

        let mut active = self.run_active.subscribe();
        if tokio::time::timeout(grace, active.wait_for(|running| !*running))
            .await
            .is_ok()
        {
            return;
        }

        // Grace elapsed with the job still holding on.
        let started_at_ms = {
            let mut state = self.state.lock().await;
            match state.run.take() {
                Some(run) => {
                    if let Some(deadline) = run.deadline {
                        deadline.abort();
                    }
                    run.started_at_ms
                },
                None => return,
            }
        };
        warn!(
            task = %self.descriptor.name,
            "task ignored cancellation, recording aborted run"
        );
        let result = ExecutionResult {
            started_at_ms,
            finished_at_ms: now_ms().max(started_at_ms),
            status: CompletionStatus::Aborted,
            name: self.descriptor.name.clone(),
            id: self.descriptor.id.clone(),
            key: self.descriptor.key.clone(),
            error_message: None,
            error_detail: None,
        };
        {
            let mut state = self.state.lock().await;
            state.last_result = Some(Some(result.clone()));
            if let Err(err) = self
                .store
                .save_last_result(&self.descriptor.id, &result)
                .await
            {
                warn!(
                    task = %self.descriptor.name,
                    error = %err,
                    "failed to persist aborted run"
                );
            }
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_completed(&self.descriptor.id, &result);
        }
    }
}
