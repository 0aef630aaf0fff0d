//! Integration tests for the task queue.
//!
//! Tests cover:
//! - Retry chains and the attempt cap
//! - Long-poll dispatch, timeout and cancellation
//! - Stale-task reaping and aged-task cleanup
//! - Lifecycle legality and concurrent status reports
//! - Status-change notifications through the hub

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use splitrun_core::config::{HubConfig, TaskQueueConfig};
use splitrun_core::error::{ErrorCode, Result};
use splitrun_core::experiments::{
    Experiment, ExperimentEvent, ExperimentId, ExperimentPhase, ExperimentResults,
};
use splitrun_core::hub::{HubClient, MessageType, NotificationHub};
use splitrun_core::store::{InMemoryStore, Store};
use splitrun_core::tasks::{
    StatusChange, Task, TaskId, TaskQueue, TaskStats, TaskStatus, STALE_TASK_MESSAGE,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn queue_config() -> TaskQueueConfig {
    TaskQueueConfig {
        poll_interval: Duration::from_millis(20),
        maintenance_interval: Duration::from_millis(50),
        stale_threshold: Duration::from_secs(5 * 60),
        retention: Duration::from_secs(24 * 60 * 60),
        max_retries: 3,
    }
}

fn setup() -> (Arc<InMemoryStore>, Arc<NotificationHub>, Arc<TaskQueue>) {
    let store = Arc::new(InMemoryStore::new());
    let hub = NotificationHub::start(HubConfig::default());
    let queue = Arc::new(TaskQueue::new(store.clone(), hub.clone(), queue_config()));
    (store, hub, queue)
}

async fn backdate(store: &InMemoryStore, task: &Task, age: Duration) {
    let mut task = store.get_task(task.id).await.unwrap().unwrap();
    task.updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
    store.update_task(&task).await.unwrap();
}

/// Store that widens race windows: every task read and status write waits
/// `delay` first, and it can let an agent complete the first stale task
/// right after the reaper has taken its snapshot.
struct RacyStore {
    inner: Arc<InMemoryStore>,
    delay: Duration,
    complete_after_stale_scan: AtomicBool,
}

impl RacyStore {
    fn new(inner: Arc<InMemoryStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            complete_after_stale_scan: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Store for RacyStore {
    async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.inner.create_experiment(experiment).await
    }

    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        self.inner.get_experiment(id).await
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.inner.list_experiments().await
    }

    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<Experiment> {
        self.inner.update_experiment_phase(id, from, to).await
    }

    async fn update_experiment_results(
        &self,
        id: ExperimentId,
        results: &ExperimentResults,
    ) -> Result<()> {
        self.inner.update_experiment_results(id, results).await
    }

    async fn create_experiment_event(&self, event: &ExperimentEvent) -> Result<()> {
        self.inner.create_experiment_event(event).await
    }

    async fn list_experiment_events(&self, id: ExperimentId) -> Result<Vec<ExperimentEvent>> {
        self.inner.list_experiment_events(id).await
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_task(id).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.inner.update_task(task).await
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<StatusChange> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .update_task_status(id, status, result, error_message)
            .await
    }

    async fn get_pending_tasks_for_host(&self, host_id: &str) -> Result<Vec<Task>> {
        self.inner.get_pending_tasks_for_host(host_id).await
    }

    async fn get_tasks_by_experiment(&self, id: ExperimentId) -> Result<Vec<Task>> {
        self.inner.get_tasks_by_experiment(id).await
    }

    async fn get_stale_tasks(&self, threshold: DateTime<Utc>) -> Result<Vec<Task>> {
        let stale = self.inner.get_stale_tasks(threshold).await?;
        if self.complete_after_stale_scan.swap(false, Ordering::SeqCst) {
            if let Some(task) = stale.first() {
                self.inner
                    .update_task_status(task.id, TaskStatus::Completed, None, None)
                    .await?;
            }
        }
        Ok(stale)
    }

    async fn delete_old_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_old_tasks(cutoff).await
    }

    async fn get_task_stats(&self) -> Result<TaskStats> {
        self.inner.get_task_stats().await
    }
}

fn racy_setup(delay: Duration) -> (Arc<InMemoryStore>, Arc<RacyStore>, Arc<TaskQueue>) {
    let inner = Arc::new(InMemoryStore::new());
    let racy = Arc::new(RacyStore::new(inner.clone(), delay));
    let hub = NotificationHub::start(HubConfig::default());
    let queue = Arc::new(TaskQueue::new(racy.clone(), hub, queue_config()));
    (inner, racy, queue)
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_three_failures_produce_three_rows() {
    let (store, _hub, queue) = setup();
    let experiment_id = ExperimentId::new();

    let first = queue
        .enqueue(Task::new("h1", "collector", "start").with_experiment(experiment_id))
        .await
        .unwrap();

    let mut current = first.clone();
    for _ in 0..3 {
        queue
            .update_task_status_with_result(
                current.id,
                TaskStatus::Failed,
                None,
                Some("collector crashed".to_string()),
            )
            .await
            .unwrap();

        let pending = store.get_pending_tasks_for_host("h1").await.unwrap();
        match pending.first() {
            Some(next) => current = next.clone(),
            None => break,
        }
    }

    let rows = queue.get_tasks_by_experiment(experiment_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|t| t.status == TaskStatus::Failed));

    let mut retry_counts: Vec<i32> = rows.iter().map(|t| t.retry_count).collect();
    retry_counts.sort();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert!(store.get_pending_tasks_for_host("h1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_keeps_config_and_lowers_priority() {
    let (store, _hub, queue) = setup();

    let task = queue
        .enqueue(
            Task::new("h1", "collector", "start")
                .with_config(serde_json::json!({"pipeline": "candidate"}))
                .with_priority(5),
        )
        .await
        .unwrap();

    queue
        .update_task_status(task.id, TaskStatus::Failed)
        .await
        .unwrap();

    let pending = store.get_pending_tasks_for_host("h1").await.unwrap();
    assert_eq!(pending.len(), 1);
    let retry = &pending[0];
    assert_ne!(retry.id, task.id);
    assert_eq!(retry.retry_count, 1);
    assert_eq!(retry.priority, 4);
    assert_eq!(retry.config["pipeline"], "candidate");
    assert_eq!(retry.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_completed_task_is_not_retried() {
    let (store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();

    let done = queue
        .update_task_status_with_result(
            task.id,
            TaskStatus::Completed,
            Some(serde_json::json!({"pid": 4242})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.result, Some(serde_json::json!({"pid": 4242})));
    assert_eq!(store.task_count(), 1);
}

#[tokio::test]
async fn test_update_unknown_task_fails() {
    let (_store, _hub, queue) = setup();
    let err = queue
        .update_task_status(splitrun_core::tasks::TaskId::new(), TaskStatus::Running)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskNotFound);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_failure_after_completion_is_rejected() {
    let (store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status_with_result(
            task.id,
            TaskStatus::Completed,
            Some(serde_json::json!({"pid": 1})),
            None,
        )
        .await
        .unwrap();

    let err = queue
        .update_task_status_with_result(
            task.id,
            TaskStatus::Failed,
            None,
            Some("late".to_string()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTaskTransition);

    let stored = queue.get_task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.error_message.is_none());
    assert_eq!(store.task_count(), 1);
}

#[tokio::test]
async fn test_cancelled_task_is_not_revived() {
    let (store, _hub, queue) = setup();
    let experiment_id = ExperimentId::new();
    let task = queue
        .enqueue(Task::new("h2", "collector", "start").with_experiment(experiment_id))
        .await
        .unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Cancelled)
        .await
        .unwrap();

    for late in [TaskStatus::Failed, TaskStatus::Running, TaskStatus::Completed] {
        let err = queue.update_task_status(task.id, late).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTaskTransition);
    }

    assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Cancelled);
    assert!(store.get_pending_tasks_for_host("h2").await.unwrap().is_empty());
    assert_eq!(queue.get_tasks_by_experiment(experiment_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_status_cannot_move_backwards() {
    let (_store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();

    let err = queue
        .update_task_status(task.id, TaskStatus::Assigned)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTaskTransition);
    assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Running);
}

#[tokio::test]
async fn test_concurrent_failure_reports_retry_once() {
    let (inner, _racy, queue) = racy_setup(Duration::from_millis(50));
    let experiment_id = ExperimentId::new();
    let task = queue
        .enqueue(Task::new("h1", "collector", "start").with_experiment(experiment_id))
        .await
        .unwrap();

    let report = || {
        queue.update_task_status_with_result(
            task.id,
            TaskStatus::Failed,
            None,
            Some("agent".to_string()),
        )
    };
    let (a, b) = tokio::join!(report(), report());
    assert_eq!(a.unwrap().status, TaskStatus::Failed);
    assert_eq!(b.unwrap().status, TaskStatus::Failed);

    let rows = queue.get_tasks_by_experiment(experiment_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let pending = inner.get_pending_tasks_for_host("h1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
}

#[tokio::test]
async fn test_agent_failure_racing_reaper_retries_once() {
    let (inner, _racy, queue) = racy_setup(Duration::from_millis(50));
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();
    backdate(&inner, &task, Duration::from_secs(6 * 60)).await;

    let (report, agent) = tokio::join!(
        queue.run_maintenance_once(),
        queue.update_task_status_with_result(
            task.id,
            TaskStatus::Failed,
            None,
            Some("crashed".to_string()),
        ),
    );
    agent.unwrap();

    assert!(report.reaped <= 1);
    assert_eq!(inner.task_count(), 2);
    assert_eq!(inner.get_pending_tasks_for_host("h1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reaper_skips_task_completed_after_snapshot() {
    let (inner, racy, queue) = racy_setup(Duration::ZERO);
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Assigned)
        .await
        .unwrap();
    backdate(&inner, &task, Duration::from_secs(6 * 60)).await;
    racy.complete_after_stale_scan.store(true, Ordering::SeqCst);

    let report = queue.run_maintenance_once().await;

    assert_eq!(report.reaped, 0);
    let stored = queue.get_task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.error_message.is_none());
    assert!(inner.get_pending_tasks_for_host("h1").await.unwrap().is_empty());
    assert_eq!(inner.task_count(), 1);
}

// ============================================================================
// Long-poll Tests
// ============================================================================

#[tokio::test]
async fn test_long_poll_returns_immediately_when_work_exists() {
    let (_store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();

    let started = Instant::now();
    let tasks = queue
        .get_pending_tasks("h1", Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task.id);
}

#[tokio::test]
async fn test_long_poll_times_out_with_empty_list() {
    let (_store, _hub, queue) = setup();

    let started = Instant::now();
    let tasks = queue
        .get_pending_tasks("idle-host", Duration::from_millis(300), &CancellationToken::new())
        .await
        .unwrap();

    assert!(tasks.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_long_poll_only_sees_own_host() {
    let (_store, _hub, queue) = setup();
    queue.enqueue(Task::new("h2", "collector", "start")).await.unwrap();

    let tasks = queue
        .get_pending_tasks("h1", Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_long_poll_does_not_assign() {
    let (store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();

    queue
        .get_pending_tasks("h1", Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();

    let stored = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
}

// ============================================================================
// Maintenance Tests
// ============================================================================

#[tokio::test]
async fn test_stale_assigned_task_is_reaped_and_retried() {
    let (store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Assigned)
        .await
        .unwrap();
    backdate(&store, &task, Duration::from_secs(6 * 60)).await;

    let report = queue.run_maintenance_once().await;
    assert_eq!(report.reaped, 1);

    let reaped = queue.get_task(task.id).await.unwrap();
    assert_eq!(reaped.status, TaskStatus::Failed);
    assert_eq!(reaped.error_message.as_deref(), Some(STALE_TASK_MESSAGE));

    let pending = store.get_pending_tasks_for_host("h1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
}

#[tokio::test]
async fn test_recent_running_task_is_not_reaped() {
    let (_store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();

    let report = queue.run_maintenance_once().await;
    assert_eq!(report.reaped, 0);
    assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Running);
}

#[tokio::test]
async fn test_old_terminal_tasks_are_cleaned() {
    let (store, _hub, queue) = setup();
    let old = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(old.id, TaskStatus::Completed)
        .await
        .unwrap();
    backdate(&store, &old, Duration::from_secs(25 * 60 * 60)).await;

    let fresh = queue.enqueue(Task::new("h1", "collector", "stop")).await.unwrap();

    let report = queue.run_maintenance_once().await;
    assert_eq!(report.cleaned, 1);
    assert!(store.get_task(old.id).await.unwrap().is_none());
    assert!(store.get_task(fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_maintenance_loop_runs_and_stops() {
    let (store, _hub, queue) = setup();
    let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();
    backdate(&store, &task, Duration::from_secs(10 * 60)).await;

    let handle = queue.start_maintenance();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop().await;

    assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Failed);
}

// ============================================================================
// Notification Tests
// ============================================================================

#[tokio::test]
async fn test_status_changes_are_published_on_experiment_topic() {
    let (_store, hub, queue) = setup();
    let experiment_id = ExperimentId::new();
    let topic = format!("experiment:{}", experiment_id);

    let (client, mut rx) = HubClient::new(16);
    let client_id = hub.register(client).await.unwrap();
    hub.subscribe(client_id, &topic).unwrap();
    rx.recv().await.unwrap(); // welcome

    let task = queue
        .enqueue(Task::new("h1", "collector", "start").with_experiment(experiment_id))
        .await
        .unwrap();
    queue
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();

    let enqueued = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enqueued.message_type, MessageType::StatusChange);
    assert_eq!(enqueued.topic.as_deref(), Some(topic.as_str()));
    assert_eq!(enqueued.data["status"], "pending");

    let running = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.data["status"], "running");
    assert_eq!(running.data["task_id"], task.id.0.to_string());

    hub.shutdown();
}
