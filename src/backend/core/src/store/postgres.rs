//! PostgreSQL store.
//!
//! Expects `experiments`, `experiment_events` and `tasks` tables matching the
//! row structs below; schema management lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use super::Store;
use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, Result, SplitrunError};
use crate::experiments::{
    EventType, Experiment, ExperimentEvent, ExperimentId, ExperimentPhase, ExperimentResults,
};
use crate::tasks::{StatusChange, Task, TaskId, TaskStats, TaskStatus};

const EXPERIMENT_COLUMNS: &str = "id, name, description, phase, config, results, \
     created_at, updated_at, started_at, completed_at";

const TASK_COLUMNS: &str = "id, host_id, experiment_id, task_type, action, config, status, \
     priority, retry_count, result, error_message, created_at, updated_at, \
     assigned_at, started_at, completed_at";

/// Store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SplitrunError::configuration("database.url is not set"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct ExperimentRow {
    id: Uuid,
    name: String,
    description: String,
    phase: String,
    config: serde_json::Value,
    results: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = SplitrunError;

    fn try_from(row: ExperimentRow) -> Result<Self> {
        Ok(Self {
            id: ExperimentId(row.id),
            name: row.name,
            description: row.description,
            phase: ExperimentPhase::parse(&row.phase)?,
            config: serde_json::from_value(row.config)?,
            results: row.results.map(serde_json::from_value).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    experiment_id: Uuid,
    event_type: String,
    phase: String,
    message: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ExperimentEvent {
    type Error = SplitrunError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
            SplitrunError::new(
                ErrorCode::SerializationError,
                format!("Unknown event type: {}", row.event_type),
            )
        })?;

        Ok(Self {
            id: row.id,
            experiment_id: ExperimentId(row.experiment_id),
            event_type,
            phase: ExperimentPhase::parse(&row.phase)?,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    host_id: String,
    experiment_id: Option<Uuid>,
    task_type: String,
    action: String,
    config: serde_json::Value,
    status: String,
    priority: i32,
    retry_count: i32,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = SplitrunError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId(row.id),
            host_id: row.host_id,
            experiment_id: row.experiment_id.map(ExperimentId),
            task_type: row.task_type,
            action: row.action,
            config: row.config,
            status: TaskStatus::parse(&row.status)?,
            priority: row.priority,
            retry_count: row.retry_count,
            result: row.result,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            assigned_at: row.assigned_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl Store for PgStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Experiments
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO experiments (id, name, description, phase, config, results,
                                     created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(experiment.id.0)
        .bind(&experiment.name)
        .bind(&experiment.description)
        .bind(experiment.phase.as_str())
        .bind(serde_json::to_value(&experiment.config)?)
        .bind(experiment.results.as_ref().map(serde_json::to_value).transpose()?)
        .bind(experiment.created_at)
        .bind(experiment.updated_at)
        .bind(experiment.started_at)
        .bind(experiment.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        let row = sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {} FROM experiments WHERE id = $1",
            EXPERIMENT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Experiment::try_from).transpose()
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let rows = sqlx::query_as::<_, ExperimentRow>(&format!(
            "SELECT {} FROM experiments ORDER BY created_at DESC",
            EXPERIMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Experiment::try_from).collect()
    }

    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<Experiment> {
        let now = Utc::now();
        let started_at = (to == ExperimentPhase::Running).then_some(now);
        let completed_at = to.is_terminal().then_some(now);

        let row = sqlx::query_as::<_, ExperimentRow>(&format!(
            r#"
            UPDATE experiments
            SET phase = $3,
                updated_at = $4,
                started_at = COALESCE($5, started_at),
                completed_at = COALESCE($6, completed_at)
            WHERE id = $1 AND phase = $2
            RETURNING {}
            "#,
            EXPERIMENT_COLUMNS
        ))
        .bind(id.0)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(started_at)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Experiment::try_from(row),
            None => {
                // Either the row is gone or another writer moved it first.
                let exists: Option<String> =
                    sqlx::query_scalar("SELECT phase FROM experiments WHERE id = $1")
                        .bind(id.0)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(actual) => Err(SplitrunError::concurrent_modification("experiment", id)
                        .with_context("expected_phase", from.as_str())
                        .with_context("actual_phase", actual)),
                    None => Err(SplitrunError::experiment_not_found(id)),
                }
            }
        }
    }

    async fn update_experiment_results(
        &self,
        id: ExperimentId,
        results: &ExperimentResults,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE experiments
            SET results = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(serde_json::to_value(results)?)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SplitrunError::experiment_not_found(id));
        }
        Ok(())
    }

    async fn create_experiment_event(&self, event: &ExperimentEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO experiment_events (id, experiment_id, event_type, phase, message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.experiment_id.0)
        .bind(event.event_type.as_str())
        .bind(event.phase.as_str())
        .bind(&event.message)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_experiment_events(&self, id: ExperimentId) -> Result<Vec<ExperimentEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, experiment_id, event_type, phase, message, metadata, created_at
            FROM experiment_events
            WHERE experiment_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExperimentEvent::try_from).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, host_id, experiment_id, task_type, action, config, status,
                               priority, retry_count, result, error_message, created_at,
                               updated_at, assigned_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.id.0)
        .bind(&task.host_id)
        .bind(task.experiment_id.map(|id| id.0))
        .bind(&task.task_type)
        .bind(&task.action)
        .bind(&task.config)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.retry_count)
        .bind(&task.result)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, priority = $3, retry_count = $4, result = $5, error_message = $6,
                config = $7, updated_at = $8, assigned_at = $9, started_at = $10, completed_at = $11
            WHERE id = $1
            "#,
        )
        .bind(task.id.0)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.retry_count)
        .bind(&task.result)
        .bind(&task.error_message)
        .bind(&task.config)
        .bind(task.updated_at)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SplitrunError::task_not_found(task.id));
        }
        Ok(())
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<StatusChange> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = $1 FOR UPDATE",
            TASK_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| SplitrunError::task_not_found(id))?;

        let mut task = Task::try_from(row)?;
        let previous = task.status;

        // A rejected move returns here and drops `tx`, releasing the row lock.
        if task.transition(status, result, error_message)? {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = $2, result = $3, error_message = $4, updated_at = $5,
                    assigned_at = $6, started_at = $7, completed_at = $8
                WHERE id = $1
                "#,
            )
            .bind(task.id.0)
            .bind(task.status.as_str())
            .bind(&task.result)
            .bind(&task.error_message)
            .bind(task.updated_at)
            .bind(task.assigned_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(StatusChange { previous, task })
    }

    async fn get_pending_tasks_for_host(&self, host_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE host_id = $1 AND status = 'pending'
            ORDER BY priority DESC, created_at
            "#,
            TASK_COLUMNS
        ))
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        into_tasks(rows)
    }

    async fn get_tasks_by_experiment(&self, id: ExperimentId) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE experiment_id = $1 ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        into_tasks(rows)
    }

    async fn get_stale_tasks(&self, threshold: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE status IN ('assigned', 'running') AND updated_at < $1
            "#,
            TASK_COLUMNS
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        into_tasks(rows)
    }

    async fn delete_old_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(deleted.rows_affected())
    }

    async fn get_task_stats(&self) -> Result<TaskStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            stats.record(TaskStatus::parse(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }
}
