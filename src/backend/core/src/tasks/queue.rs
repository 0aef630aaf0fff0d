//! Task queue: enqueue, long-poll dispatch, status updates and retry.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{StatusChange, Task, TaskId, TaskStats, TaskStatus};
use crate::config::TaskQueueConfig;
use crate::error::{Result, SplitrunError};
use crate::experiments::ExperimentId;
use crate::hub::NotificationHub;
use crate::observability::metrics as queue_metrics;
use crate::store::Store;

/// Owns every task status change in the system.
pub struct TaskQueue {
    pub(super) store: Arc<dyn Store>,
    hub: Arc<NotificationHub>,
    pub(super) config: TaskQueueConfig,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, hub: Arc<NotificationHub>, config: TaskQueueConfig) -> Self {
        Self { store, hub, config }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a task as pending. Never waits on agents.
    pub async fn enqueue(&self, mut task: Task) -> Result<Task> {
        let now = chrono::Utc::now();
        task.status = TaskStatus::Pending;
        task.created_at = now;
        task.updated_at = now;

        self.store.create_task(&task).await?;

        counter!(queue_metrics::TASKS_ENQUEUED, "type" => task.task_type.clone()).increment(1);
        info!(
            task_id = %task.id,
            host_id = %task.host_id,
            experiment_id = ?task.experiment_id.map(|id| id.to_string()),
            task_type = %task.task_type,
            action = %task.action,
            retry_count = task.retry_count,
            "Task enqueued"
        );
        self.publish(&task);

        Ok(task)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Long-poll
    // ─────────────────────────────────────────────────────────────────────────

    /// Pending tasks for `host_id`, waiting up to `timeout` for some to appear.
    ///
    /// Returns immediately when tasks exist. Timeout and cancellation are
    /// normal outcomes and yield an empty list; only store failures are errors.
    pub async fn get_pending_tasks(
        &self,
        host_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>> {
        let tasks = self.store.get_pending_tasks_for_host(host_id).await?;
        if !tasks.is_empty() {
            return Ok(tasks);
        }

        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(host_id = %host_id, "Long-poll cancelled by caller");
                    return Ok(Vec::new());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(host_id = %host_id, "Long-poll timed out");
                    return Ok(Vec::new());
                }
                _ = ticker.tick() => {
                    let tasks = self.store.get_pending_tasks_for_host(host_id).await?;
                    if !tasks.is_empty() {
                        return Ok(tasks);
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status updates
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<Task> {
        self.update_task_status_with_result(task_id, status, None, None)
            .await
    }

    /// Apply a status report. A transition into `failed` synthesizes a retry
    /// row while the chain has attempts left; the failed row stays as history.
    ///
    /// Repeating the stored status is accepted and changes nothing. Reports
    /// that would move the task backwards or out of a terminal status fail
    /// with `InvalidTaskTransition`.
    pub async fn update_task_status_with_result(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Task> {
        Ok(self
            .apply_report(task_id, status, result, error_message)
            .await?
            .task)
    }

    pub(super) async fn apply_report(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<StatusChange> {
        let change = self
            .store
            .update_task_status(task_id, status, result, error_message)
            .await?;

        if !change.applied() {
            debug!(task_id = %task_id, status = %status, "Ignoring repeated status report");
            return Ok(change);
        }

        let task = &change.task;
        info!(
            task_id = %task.id,
            host_id = %task.host_id,
            from = %change.previous,
            to = %task.status,
            "Task status updated"
        );
        self.publish(task);

        // Only the report that moved the row into `failed` gets here, so a
        // chain forks at most once per failure.
        if task.status == TaskStatus::Failed {
            self.retry_failed(task).await?;
        }

        Ok(change)
    }

    async fn retry_failed(&self, task: &Task) -> Result<()> {
        if task.retry_count + 1 >= self.config.max_retries {
            warn!(
                task_id = %task.id,
                host_id = %task.host_id,
                retry_count = task.retry_count,
                error = ?task.error_message,
                "Task failed with no retries left"
            );
            return Ok(());
        }

        let retry = self.enqueue(task.retry()).await?;
        counter!(queue_metrics::TASK_RETRIES, "type" => task.task_type.clone()).increment(1);
        info!(
            task_id = %task.id,
            retry_task_id = %retry.id,
            retry_count = retry.retry_count,
            priority = retry.priority,
            "Retry enqueued for failed task"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SplitrunError::task_not_found(task_id))
    }

    pub async fn get_tasks_by_experiment(&self, experiment_id: ExperimentId) -> Result<Vec<Task>> {
        self.store.get_tasks_by_experiment(experiment_id).await
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.store.get_task_stats().await
    }

    fn publish(&self, task: &Task) {
        self.hub.broadcast_status_change(
            task.topic(),
            serde_json::json!({
                "task_id": task.id,
                "host_id": task.host_id,
                "experiment_id": task.experiment_id,
                "type": task.task_type,
                "action": task.action,
                "status": task.status,
                "retry_count": task.retry_count,
                "error_message": task.error_message,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::store::InMemoryStore;

    fn queue() -> (Arc<InMemoryStore>, TaskQueue) {
        let store = Arc::new(InMemoryStore::new());
        let hub = NotificationHub::start(HubConfig::default());
        let config = TaskQueueConfig {
            poll_interval: Duration::from_millis(20),
            ..TaskQueueConfig::default()
        };
        (store.clone(), TaskQueue::new(store, hub, config))
    }

    #[tokio::test]
    async fn test_enqueue_forces_pending() {
        let (_, queue) = queue();
        let mut task = Task::new("h1", "collector", "start");
        task.status = TaskStatus::Running;

        let task = queue.enqueue(task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_update_unknown_task() {
        let (_, queue) = queue();
        let err = queue
            .update_task_status(TaskId::new(), TaskStatus::Running)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::TaskNotFound);
    }

    #[tokio::test]
    async fn test_repeated_failure_report_retries_once() {
        let (store, queue) = queue();
        let task = queue.enqueue(Task::new("h1", "collector", "start")).await.unwrap();

        queue
            .update_task_status_with_result(task.id, TaskStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        queue
            .update_task_status_with_result(task.id, TaskStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();

        assert_eq!(store.task_count(), 2);
    }

    #[tokio::test]
    async fn test_report_after_cancel_is_rejected() {
        let (store, queue) = queue();
        let task = queue.enqueue(Task::new("h2", "collector", "start")).await.unwrap();
        queue.update_task_status(task.id, TaskStatus::Cancelled).await.unwrap();

        for late in [TaskStatus::Failed, TaskStatus::Running] {
            let err = queue.update_task_status(task.id, late).await.unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::InvalidTaskTransition);
        }

        assert_eq!(queue.get_task(task.id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(store.get_pending_tasks_for_host("h2").await.unwrap().is_empty());
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_long_poll_picks_up_late_task() {
        let (_, queue) = queue();
        let queue = Arc::new(queue);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                queue.enqueue(Task::new("h1", "collector", "stop")).await.unwrap();
            })
        };

        let started = std::time::Instant::now();
        let tasks = queue
            .get_pending_tasks("h1", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        producer.await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_long_poll_cancellation_returns_empty() {
        let (_, queue) = queue();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let tasks = queue
            .get_pending_tasks("h1", Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }
}
