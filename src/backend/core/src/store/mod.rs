//! Persistence boundary.
//!
//! The control plane consumes storage through the [`Store`] trait:
//!
//! - **InMemoryStore**: process-local tables behind one lock, used in tests
//!   and when no database URL is configured
//! - **PgStore**: PostgreSQL via sqlx
//!
//! Both serialize per-row read-modify-write. Experiment phase changes are
//! conditional on the phase the caller observed, and task status changes are
//! checked against the task lifecycle under a row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::experiments::{
    Experiment, ExperimentEvent, ExperimentId, ExperimentPhase, ExperimentResults,
};
use crate::tasks::{StatusChange, Task, TaskId, TaskStats, TaskStatus};

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Durable storage for experiments, their events, and tasks.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Experiments
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_experiment(&self, experiment: &Experiment) -> Result<()>;

    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>>;

    /// All experiments, newest first.
    async fn list_experiments(&self) -> Result<Vec<Experiment>>;

    /// Move an experiment from `from` to `to`.
    ///
    /// Fails with `ConcurrentModification` when the stored phase is no longer
    /// `from`, and with `ExperimentNotFound` when the row is missing.
    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<Experiment>;

    async fn update_experiment_results(
        &self,
        id: ExperimentId,
        results: &ExperimentResults,
    ) -> Result<()>;

    async fn create_experiment_event(&self, event: &ExperimentEvent) -> Result<()>;

    /// Events for an experiment in the order they were recorded.
    async fn list_experiment_events(&self, id: ExperimentId) -> Result<Vec<ExperimentEvent>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Overwrite a task row as given.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Atomically load a task, apply a status change and persist it.
    ///
    /// The lifecycle check runs against the locked row, so of two concurrent
    /// reports at most one moves the task into a given status; the other sees
    /// the status already stored and gets an unapplied [`StatusChange`].
    /// Fails with `InvalidTaskTransition` for moves the lifecycle forbids.
    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<StatusChange>;

    /// Pending tasks for a host, highest priority first.
    async fn get_pending_tasks_for_host(&self, host_id: &str) -> Result<Vec<Task>>;

    async fn get_tasks_by_experiment(&self, id: ExperimentId) -> Result<Vec<Task>>;

    /// Assigned or running tasks last updated before `threshold`.
    async fn get_stale_tasks(&self, threshold: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Delete terminal tasks last updated before `cutoff`, returning how many.
    async fn delete_old_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn get_task_stats(&self) -> Result<TaskStats>;
}
