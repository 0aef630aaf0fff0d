//! Task definitions.
//!
//! A task is one unit of work for one agent host. Its status moves
//! `pending -> assigned -> running -> completed | failed | cancelled`, and a
//! failed task is never rewritten into its retry: the retry is a fresh row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SplitrunError};
use crate::experiments::ExperimentId;

/// Task type of the collector start/stop tasks issued by the lifecycle.
pub const COLLECTOR_TASK_TYPE: &str = "collector";
pub const ACTION_START: &str = "start";
pub const ACTION_STOP: &str = "stop";

// ═══════════════════════════════════════════════════════════════════════════════
// Task Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its agent to pick it up
    Pending,
    /// Handed to an agent
    Assigned,
    /// Agent reported it is executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Withdrawn by the lifecycle before completion
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Assigned,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a status reported by an agent or stored in a row.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SplitrunError::invalid_task_status(other)),
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is held by an agent and can therefore go stale.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Position along `pending -> assigned -> running -> terminal`.
    fn stage(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Assigned => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether a task may move from `self` to `next`.
    ///
    /// Statuses only move forward, intermediate steps may be skipped, and a
    /// terminal status is final.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SplitrunError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work dispatched to a single agent host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Target agent
    pub host_id: String,
    /// Owning experiment, if any
    pub experiment_id: Option<ExperimentId>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub action: String,
    /// Opaque parameters for the agent
    #[serde(default)]
    pub config: serde_json::Value,
    pub status: TaskStatus,
    /// Higher is dispatched first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: i32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for `host_id`.
    pub fn new(host_id: impl Into<String>, task_type: impl Into<String>, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            host_id: host_id.into(),
            experiment_id: None,
            task_type: task_type.into(),
            action: action.into(),
            config: serde_json::Value::Object(Default::default()),
            status: TaskStatus::Pending,
            priority: 0,
            retry_count: 0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_experiment(mut self, experiment_id: ExperimentId) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this is a collector task with the given action.
    pub fn is_collector(&self, action: &str) -> bool {
        self.task_type == COLLECTOR_TASK_TYPE && self.action == action
    }

    /// Build the successor row for a failed task.
    ///
    /// Same host, experiment, type, action and config; priority one lower
    /// (saturating at `i32::MIN`) and retry count one higher.
    pub fn retry(&self) -> Self {
        Task::new(&self.host_id, &self.task_type, &self.action)
            .with_config(self.config.clone())
            .with_priority(self.priority.saturating_sub(1))
            .with_retry_count(self.retry_count + 1)
            .with_optional_experiment(self.experiment_id)
    }

    fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    fn with_optional_experiment(mut self, experiment_id: Option<ExperimentId>) -> Self {
        self.experiment_id = experiment_id;
        self
    }

    /// Move to `status` if the lifecycle allows it.
    ///
    /// Returns `Ok(false)` without touching the task when `status` is the
    /// current status, so repeated reports are harmless. Any other move that
    /// [`TaskStatus::can_transition_to`] forbids fails with
    /// `InvalidTaskTransition`.
    pub fn transition(
        &mut self,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<bool> {
        if self.status == status {
            return Ok(false);
        }
        if !self.status.can_transition_to(status) {
            return Err(SplitrunError::invalid_task_transition(self.id, self.status, status));
        }
        self.apply_status(status, result, error_message);
        Ok(true)
    }

    /// Apply a status change, stamping the timestamp that belongs to it.
    fn apply_status(
        &mut self,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;

        match status {
            TaskStatus::Assigned => self.assigned_at = Some(now),
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            TaskStatus::Pending | TaskStatus::Cancelled => {}
        }

        if result.is_some() {
            self.result = result;
        }
        if error_message.is_some() {
            self.error_message = error_message;
        }
    }

    /// Topic on which status changes for this task are published.
    pub fn topic(&self) -> String {
        match self.experiment_id {
            Some(id) => format!("experiment:{}", id),
            None => format!("host:{}", self.host_id),
        }
    }
}

/// A task as stored after a status report, with the status it held before.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: TaskStatus,
    pub task: Task,
}

impl StatusChange {
    /// False when the report repeated the stored status and nothing was written.
    pub fn applied(&self) -> bool {
        self.previous != self.task.status
    }
}

/// Counts of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Assigned => self.assigned += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.assigned + self.running + self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_status_parse() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        let err = TaskStatus::parse("exploded").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTaskStatus);
    }

    #[test]
    fn test_apply_status_stamps_timestamps() {
        let mut task = Task::new("host-1", COLLECTOR_TASK_TYPE, ACTION_START);
        task.apply_status(TaskStatus::Assigned, None, None);
        assert!(task.assigned_at.is_some());
        assert!(task.started_at.is_none());

        task.apply_status(TaskStatus::Running, None, None);
        assert!(task.started_at.is_some());

        task.apply_status(
            TaskStatus::Completed,
            Some(serde_json::json!({"pid": 42})),
            None,
        );
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(serde_json::json!({"pid": 42})));
    }

    #[test]
    fn test_status_only_moves_forward() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Completed));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Running.can_transition_to(Assigned));
        assert!(!Assigned.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_transition_rejects_leaving_terminal_status() {
        let mut task = Task::new("host-1", COLLECTOR_TASK_TYPE, ACTION_START);
        assert!(task.transition(TaskStatus::Completed, None, None).unwrap());
        let completed_at = task.completed_at;

        let err = task
            .transition(TaskStatus::Failed, None, Some("late".into()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTaskTransition);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, completed_at);
        assert!(task.error_message.is_none());
    }

    #[test]
    fn test_transition_repeat_is_noop() {
        let mut task = Task::new("host-1", COLLECTOR_TASK_TYPE, ACTION_START);
        task.transition(TaskStatus::Running, None, None).unwrap();
        let started_at = task.started_at;

        assert!(!task.transition(TaskStatus::Running, None, None).unwrap());
        assert_eq!(task.started_at, started_at);
    }

    #[test]
    fn test_retry_clones_and_deprioritizes() {
        let experiment_id = ExperimentId::new();
        let original = Task::new("host-1", COLLECTOR_TASK_TYPE, ACTION_START)
            .with_experiment(experiment_id)
            .with_config(serde_json::json!({"pipeline": "candidate"}))
            .with_priority(5);

        let retry = original.retry();
        assert_ne!(retry.id, original.id);
        assert_eq!(retry.host_id, "host-1");
        assert_eq!(retry.experiment_id, Some(experiment_id));
        assert_eq!(retry.config, original.config);
        assert_eq!(retry.priority, 4);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, TaskStatus::Pending);
    }

    #[test]
    fn test_retry_priority_saturates() {
        let task = Task::new("host-1", "collector", "start").with_priority(i32::MIN);
        assert_eq!(task.retry().priority, i32::MIN);
    }

    #[test]
    fn test_serializes_type_field() {
        let task = Task::new("host-1", "collector", "start");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "collector");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_topic() {
        let task = Task::new("host-7", "collector", "start");
        assert_eq!(task.topic(), "host:host-7");

        let id = ExperimentId::new();
        let task = task.with_experiment(id);
        assert_eq!(task.topic(), format!("experiment:{}", id));
    }
}
