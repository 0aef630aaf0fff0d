//! In-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::Store;
use crate::error::{Result, SplitrunError};
use crate::experiments::{
    Experiment, ExperimentEvent, ExperimentId, ExperimentPhase, ExperimentResults,
};
use crate::tasks::{StatusChange, Task, TaskId, TaskStats, TaskStatus};

#[derive(Default)]
struct Tables {
    experiments: HashMap<ExperimentId, Experiment>,
    events: Vec<ExperimentEvent>,
    tasks: HashMap<TaskId, Task>,
}

/// Process-local store. Every write takes the single table lock, which
/// serializes read-modify-write per row.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task rows, in any status.
    pub fn task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }
}

fn by_priority(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.experiments.contains_key(&experiment.id) {
            return Err(SplitrunError::new(
                crate::error::ErrorCode::DuplicateRecord,
                format!("Experiment already exists: {}", experiment.id),
            ));
        }
        tables.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.tables.read().experiments.get(&id).cloned())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> =
            self.tables.read().experiments.values().cloned().collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<Experiment> {
        let mut tables = self.tables.write();
        let experiment = tables
            .experiments
            .get_mut(&id)
            .ok_or_else(|| SplitrunError::experiment_not_found(id))?;

        if experiment.phase != from {
            return Err(SplitrunError::concurrent_modification("experiment", id)
                .with_context("expected_phase", from.as_str())
                .with_context("actual_phase", experiment.phase.as_str()));
        }

        experiment.enter_phase(to);
        Ok(experiment.clone())
    }

    async fn update_experiment_results(
        &self,
        id: ExperimentId,
        results: &ExperimentResults,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let experiment = tables
            .experiments
            .get_mut(&id)
            .ok_or_else(|| SplitrunError::experiment_not_found(id))?;
        experiment.results = Some(results.clone());
        experiment.updated_at = Utc::now();
        Ok(())
    }

    async fn create_experiment_event(&self, event: &ExperimentEvent) -> Result<()> {
        self.tables.write().events.push(event.clone());
        Ok(())
    }

    async fn list_experiment_events(&self, id: ExperimentId) -> Result<Vec<ExperimentEvent>> {
        Ok(self
            .tables
            .read()
            .events
            .iter()
            .filter(|e| e.experiment_id == id)
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        self.tables.write().tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.tasks.get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(SplitrunError::task_not_found(task.id)),
        }
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<StatusChange> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| SplitrunError::task_not_found(id))?;
        let previous = task.status;
        task.transition(status, result, error_message)?;
        Ok(StatusChange {
            previous,
            task: task.clone(),
        })
    }

    async fn get_pending_tasks_for_host(&self, host_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.host_id == host_id && t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by(by_priority);
        Ok(tasks)
    }

    async fn get_tasks_by_experiment(&self, id: ExperimentId) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.experiment_id == Some(id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_stale_tasks(&self, threshold: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight() && t.updated_at < threshold)
            .cloned()
            .collect())
    }

    async fn delete_old_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.tasks.len();
        tables
            .tasks
            .retain(|_, t| !(t.status.is_terminal() && t.updated_at < cutoff));
        Ok((before - tables.tasks.len()) as u64)
    }

    async fn get_task_stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats::default();
        for task in self.tables.read().tasks.values() {
            stats.record(task.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::experiments::{ExperimentConfig, NewExperiment, SuccessCriteria};

    fn experiment() -> Experiment {
        Experiment::new(NewExperiment {
            name: "sampling".to_string(),
            description: String::new(),
            config: ExperimentConfig {
                baseline_pipeline: "base".to_string(),
                candidate_pipeline: "cand".to_string(),
                target_hosts: vec!["h1".to_string()],
                success_criteria: SuccessCriteria::default(),
                duration: None,
            },
        })
    }

    #[tokio::test]
    async fn test_conditional_phase_update() {
        let store = InMemoryStore::new();
        let exp = experiment();
        store.create_experiment(&exp).await.unwrap();

        let updated = store
            .update_experiment_phase(exp.id, ExperimentPhase::Pending, ExperimentPhase::Deploying)
            .await
            .unwrap();
        assert_eq!(updated.phase, ExperimentPhase::Deploying);

        let err = store
            .update_experiment_phase(exp.id, ExperimentPhase::Pending, ExperimentPhase::Deploying)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConcurrentModification);
    }

    #[tokio::test]
    async fn test_missing_experiment() {
        let store = InMemoryStore::new();
        let err = store
            .update_experiment_phase(
                ExperimentId::new(),
                ExperimentPhase::Pending,
                ExperimentPhase::Deploying,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExperimentNotFound);
    }

    #[tokio::test]
    async fn test_pending_tasks_ordered_by_priority() {
        let store = InMemoryStore::new();
        let low = Task::new("h1", "collector", "start").with_priority(1);
        let high = Task::new("h1", "collector", "start").with_priority(9);
        let other_host = Task::new("h2", "collector", "start").with_priority(50);
        for task in [&low, &high, &other_host] {
            store.create_task(task).await.unwrap();
        }

        let pending = store.get_pending_tasks_for_host("h1").await.unwrap();
        let ids: Vec<TaskId> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn test_delete_old_tasks_only_terminal() {
        let store = InMemoryStore::new();
        let old = Utc::now() - chrono::Duration::hours(48);

        let mut done = Task::new("h1", "collector", "start");
        done.status = TaskStatus::Completed;
        done.updated_at = old;
        let mut running = Task::new("h1", "collector", "start");
        running.status = TaskStatus::Running;
        running.updated_at = old;
        let fresh_done = {
            let mut t = Task::new("h1", "collector", "start");
            t.status = TaskStatus::Failed;
            t
        };

        for task in [&done, &running, &fresh_done] {
            store.create_task(task).await.unwrap();
        }

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.delete_old_tasks(cutoff).await.unwrap(), 1);
        assert!(store.get_task(done.id).await.unwrap().is_none());
        assert!(store.get_task(running.id).await.unwrap().is_some());
        assert!(store.get_task(fresh_done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status_update_checked_under_lock() {
        let store = InMemoryStore::new();
        let task = Task::new("h1", "collector", "start");
        store.create_task(&task).await.unwrap();

        let change = store
            .update_task_status(task.id, TaskStatus::Cancelled, None, None)
            .await
            .unwrap();
        assert!(change.applied());
        assert_eq!(change.previous, TaskStatus::Pending);

        let repeat = store
            .update_task_status(task.id, TaskStatus::Cancelled, None, None)
            .await
            .unwrap();
        assert!(!repeat.applied());

        let err = store
            .update_task_status(task.id, TaskStatus::Running, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTaskTransition);
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_task_stats() {
        let store = InMemoryStore::new();
        let a = Task::new("h1", "collector", "start");
        let b = Task::new("h1", "collector", "start");
        store.create_task(&a).await.unwrap();
        store.create_task(&b).await.unwrap();
        store
            .update_task_status(b.id, TaskStatus::Running, None, None)
            .await
            .unwrap();

        let stats = store.get_task_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 2);
    }
}
