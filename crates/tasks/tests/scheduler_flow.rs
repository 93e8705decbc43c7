//! End-to-end flow through the public API: trigger fires, manager queues,
//! worker executes, history lands on disk.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tempfile::TempDir,
    tokio::time::sleep,
    tokio_util::sync::CancellationToken,
};

use mezzo_tasks::{
    job::{JobError, JobResult, ProgressReporter, ScheduledJob},
    manager::{SchedulerConfig, TaskManager},
    store::TaskStore,
    store_file::FileTaskStore,
    types::{CompletionStatus, NotifyFn, TaskNotification, TriggerDescriptor},
};

struct LibraryScan {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl ScheduledJob for LibraryScan {
    fn name(&self) -> &str {
        "Scan media library"
    }

    fn description(&self) -> &str {
        "Walks the library roots and imports new media"
    }

    fn category(&self) -> &str {
        "Library"
    }

    fn key(&self) -> &str {
        "library-scan"
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> JobResult {
        for step in 0..4u32 {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            progress.report(f64::from(step) * 25.0);
            sleep(Duration::from_millis(5)).await;
        }
        progress.report(100.0);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn interval_trigger_drives_repeated_runs_with_history_on_disk() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FileTaskStore::new(tmp.path()));
    let runs = Arc::new(AtomicUsize::new(0));

    let notifications: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notifications);
    let on_notify: NotifyFn = Arc::new(move |notification| {
        let label = match notification {
            TaskNotification::Queued { .. } => "queued",
            TaskNotification::Executing { .. } => "executing",
            TaskNotification::Progress { .. } => "progress",
            TaskNotification::Completed { .. } => "completed",
        };
        sink.lock().unwrap().push(label.to_string());
    });

    let manager = TaskManager::with_config(
        store.clone() as Arc<dyn TaskStore>,
        SchedulerConfig {
            max_concurrent: 2,
            shutdown_grace_ms: 1_000,
        },
        Some(on_notify),
    );
    let worker = manager
        .register(LibraryScan {
            runs: Arc::clone(&runs),
        })
        .await;
    let task_id = worker.descriptor().id.clone();

    // Operator configures a tight interval; the set is persisted immediately.
    worker
        .set_triggers(vec![TriggerDescriptor::interval(100)])
        .await
        .unwrap();
    assert!(tmp.path().join(format!("triggers/{task_id}.json")).exists());

    manager.start().await.unwrap();

    // First fire at ~100ms, re-arm after the settle delay, then a second
    // fire one interval later.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while runs.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    assert!(
        runs.load(Ordering::SeqCst) >= 2,
        "expected at least two scheduled runs"
    );

    // History is on disk and readable through the store.
    let record = store.load_last_result(&task_id).await.unwrap().unwrap();
    assert_eq!(record.status, CompletionStatus::Completed);
    assert_eq!(record.key, "library-scan");
    assert!(record.started_at_ms <= record.finished_at_ms);
    assert!(tmp.path().join(format!("history/{task_id}.json")).exists());

    manager.shutdown().await;
    assert!(!manager.status().await.running);

    let seen = notifications.lock().unwrap().clone();
    assert!(seen.contains(&"queued".to_string()));
    assert!(seen.contains(&"executing".to_string()));
    assert!(seen.contains(&"completed".to_string()));
}

#[tokio::test]
async fn stored_triggers_survive_a_restart() {
    let tmp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let configured = vec![TriggerDescriptor::daily(4 * 60 * 60 * 1000)];

    // First process lifetime: operator replaces the trigger set.
    {
        let store = Arc::new(FileTaskStore::new(tmp.path()));
        let manager = TaskManager::new(store as Arc<dyn TaskStore>);
        let worker = manager
            .register(LibraryScan {
                runs: Arc::clone(&runs),
            })
            .await;
        worker.set_triggers(configured.clone()).await.unwrap();
        manager.shutdown().await;
    }

    // Second process lifetime: the stored set wins over the defaults.
    {
        let store = Arc::new(FileTaskStore::new(tmp.path()));
        let manager = TaskManager::new(store as Arc<dyn TaskStore>);
        let worker = manager
            .register(LibraryScan {
                runs: Arc::clone(&runs),
            })
            .await;
        manager.start().await.unwrap();
        assert_eq!(worker.triggers().await, configured);
        manager.shutdown().await;
    }
}
