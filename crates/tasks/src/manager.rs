//! Cross-job coordination: worker registry, execution queue, dispatch policy.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

use {
    futures::future::join_all,
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    job::ScheduledJob,
    store::TaskStore,
    types::{
        DAY_MS, ExecutionResult, JobDescriptor, NotifyFn, RunOptions, SchedulerStatus,
        TaskNotification, TriggerDescriptor, derive_task_id,
    },
    worker::TaskWorker,
};

/// Coordination contract workers call back through.
///
/// Held by each worker as a non-owning `Weak` handle; implementations must
/// return promptly and never block on the calling worker.
pub trait TaskCoordinator: Send + Sync {
    /// Schedule a task for execution. Fire-and-forget; the coordinator
    /// decides when the execution actually starts.
    fn enqueue(&self, task_id: &str, options: RunOptions);

    /// Invoked exactly once when a worker transitions Idle to Running.
    fn on_executing(&self, task_id: &str);

    /// Invoked exactly once per execution with the final result.
    fn on_completed(&self, task_id: &str, result: &ExecutionResult);

    /// Progress re-publication; informational only.
    fn on_progress(&self, task_id: &str, percent: f64) {
        let _ = (task_id, percent);
    }
}

/// Trigger set for jobs that expose no defaults: one daily-cadence interval.
fn default_trigger_set() -> Vec<TriggerDescriptor> {
    vec![TriggerDescriptor::interval(DAY_MS)]
}

/// Scheduling policy knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Executions allowed to run at once; the rest queue FIFO.
    pub max_concurrent: usize,
    /// How long shutdown waits for a cancelled run to exit.
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            shutdown_grace_ms: 3_000,
        }
    }
}

struct QueueEntry {
    task_id: String,
    options: RunOptions,
}

/// Queue and running-set under one lock, so enqueue-time dedup and dispatch
/// never interleave.
#[derive(Default)]
struct DispatchState {
    queue: VecDeque<QueueEntry>,
    running: HashSet<String>,
}

/// The scheduler: owns every [`TaskWorker`], the execution queue, and the
/// concurrency policy deciding which queued executions may start.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
    workers: RwLock<Vec<Arc<TaskWorker>>>,
    dispatch: StdMutex<DispatchState>,
    wake: Notify,
    running: RwLock<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    on_notify: Option<NotifyFn>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Arc<Self> {
        Self::with_config(store, SchedulerConfig::default(), None)
    }

    /// Create a manager with a notification callback for status surfaces.
    pub fn with_notify(store: Arc<dyn TaskStore>, on_notify: NotifyFn) -> Arc<Self> {
        Self::with_config(store, SchedulerConfig::default(), Some(on_notify))
    }

    /// Create a manager with all configuration options.
    pub fn with_config(
        store: Arc<dyn TaskStore>,
        config: SchedulerConfig,
        on_notify: Option<NotifyFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            workers: RwLock::new(Vec::new()),
            dispatch: StdMutex::new(DispatchState::default()),
            wake: Notify::new(),
            running: RwLock::new(false),
            dispatcher: Mutex::new(None),
            on_notify,
        })
    }

    /// Emit a notification if a callback is registered.
    fn notify(&self, notification: TaskNotification) {
        if let Some(notify_fn) = &self.on_notify {
            notify_fn(notification);
        }
    }

    /// Register a job. Its stable id derives from the concrete type, so the
    /// same job type maps to the same stored records across restarts.
    pub async fn register<J: ScheduledJob>(self: &Arc<Self>, job: J) -> Arc<TaskWorker> {
        let id = derive_task_id(std::any::type_name::<J>());
        let job: Arc<dyn ScheduledJob> = Arc::new(job);
        let descriptor = JobDescriptor {
            id,
            name: job.name().to_string(),
            description: job.description().to_string(),
            category: job.category().to_string(),
            key: job.key().to_string(),
        };
        let coordinator: Weak<dyn TaskCoordinator> = {
            let arc: Arc<dyn TaskCoordinator> = self.clone();
            Arc::downgrade(&arc)
        };
        let worker = TaskWorker::new(descriptor, job, Arc::clone(&self.store), coordinator);
        self.workers.write().await.push(Arc::clone(&worker));
        info!(
            task = %worker.descriptor().name,
            id = %worker.descriptor().id,
            "task registered"
        );
        worker
    }

    /// Arm every worker's triggers (stored set, else the job's defaults,
    /// else one 24-hour interval) and start the dispatcher.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let workers = self.workers.read().await.clone();
        for worker in &workers {
            let stored = match self.store.load_triggers(&worker.descriptor().id).await {
                Ok(triggers) => triggers,
                Err(err) => {
                    warn!(
                        task = %worker.descriptor().name,
                        error = %err,
                        "unreadable trigger configuration, using defaults"
                    );
                    None
                },
            };
            let descriptors = stored
                .or_else(|| {
                    let defaults = worker.job().default_triggers();
                    (!defaults.is_empty()).then_some(defaults)
                })
                .unwrap_or_else(default_trigger_set);
            if let Err(err) = worker.arm_triggers(descriptors, true).await {
                warn!(
                    task = %worker.descriptor().name,
                    error = %err,
                    "invalid trigger configuration, task will not fire"
                );
            }
        }

        *self.running.write().await = true;
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.dispatch_loop().await });
        *self.dispatcher.lock().await = Some(handle);
        // Drain anything queued before the dispatcher existed.
        self.wake.notify_one();
        info!(count = workers.len(), "task scheduler started");
        Ok(())
    }

    /// Stop dispatching, then tear every worker down.
    pub async fn shutdown(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }
        {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            dispatch.queue.clear();
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let workers = self.workers.read().await.clone();
        join_all(workers.iter().map(|worker| worker.shutdown(grace))).await;
        info!("task scheduler stopped");
    }

    /// All registered workers.
    pub async fn workers(&self) -> Vec<Arc<TaskWorker>> {
        self.workers.read().await.clone()
    }

    /// Look up a worker by task id.
    pub async fn worker(&self, task_id: &str) -> Option<Arc<TaskWorker>> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .find(|w| w.descriptor().id == task_id)
            .cloned()
    }

    /// Queue a task for execution now, outside its schedule.
    pub async fn run_now(&self, task_id: &str) -> Result<()> {
        if self.worker(task_id).await.is_none() {
            return Err(Error::task_not_found(task_id));
        }
        self.enqueue(task_id, RunOptions::default());
        Ok(())
    }

    /// Request cancellation of a running task.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let worker = self
            .worker(task_id)
            .await
            .ok_or_else(|| Error::task_not_found(task_id))?;
        worker.cancel().await
    }

    /// Scheduler summary for status surfaces.
    pub async fn status(&self) -> SchedulerStatus {
        let workers = self.workers.read().await;
        let running = *self.running.read().await;
        let (queued_count, running_count) = {
            let dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            (dispatch.queue.len(), dispatch.running.len())
        };
        SchedulerStatus {
            running,
            task_count: workers.len(),
            running_count,
            queued_count,
        }
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            if !*self.running.read().await {
                break;
            }
            self.dispatch_ready().await;
        }
    }

    /// Start queued executions while capacity allows.
    async fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
                if dispatch.running.len() >= self.config.max_concurrent {
                    break;
                }
                let Some(entry) = dispatch.queue.pop_front() else {
                    break;
                };
                dispatch.running.insert(entry.task_id.clone());
                entry
            };
            let Some(worker) = self.worker(&entry.task_id).await else {
                debug!(task_id = %entry.task_id, "queued task no longer registered");
                self.dispatch
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .running
                    .remove(&entry.task_id);
                continue;
            };
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = worker.execute(entry.options).await {
                    warn!(
                        task = %worker.descriptor().name,
                        error = %err,
                        "execution request rejected"
                    );
                }
                manager
                    .dispatch
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .running
                    .remove(&worker.descriptor().id);
                manager.wake.notify_one();
            });
        }
    }
}

impl TaskCoordinator for TaskManager {
    fn enqueue(&self, task_id: &str, options: RunOptions) {
        {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            if dispatch.running.contains(task_id)
                || dispatch.queue.iter().any(|e| e.task_id == task_id)
            {
                debug!(task_id, "dropping duplicate execution request");
                return;
            }
            dispatch.queue.push_back(QueueEntry {
                task_id: task_id.to_string(),
                options,
            });
        }
        self.notify(TaskNotification::Queued {
            task_id: task_id.to_string(),
        });
        self.wake.notify_one();
    }

    fn on_executing(&self, task_id: &str) {
        self.notify(TaskNotification::Executing {
            task_id: task_id.to_string(),
        });
    }

    fn on_completed(&self, task_id: &str, result: &ExecutionResult) {
        self.notify(TaskNotification::Completed {
            task_id: task_id.to_string(),
            result: result.clone(),
        });
    }

    fn on_progress(&self, task_id: &str, percent: f64) {
        self.notify(TaskNotification::Progress {
            task_id: task_id.to_string(),
            percent,
        });
    }
}
