//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, SplitrunError>` so that
//! errors are converted to the matching HTTP status by the
//! `IntoResponse` implementation on `SplitrunError`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::SplitrunError;
use crate::experiments::{ExperimentId, ExperimentPhase, NewExperiment};
use crate::tasks::{Task, TaskId, TaskStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "hub_clients": state.hub.client_count(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics disabled\n".to_string(),
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Experiment Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_experiment(
    State(state): State<AppState>,
    Json(req): Json<NewExperiment>,
) -> Result<impl IntoResponse, SplitrunError> {
    let experiment = state.state_machine.create_experiment(req).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(experiment))))
}

pub async fn list_experiments(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, SplitrunError> {
    let experiments = state.state_machine.list_experiments().await?;
    Ok(Json(ApiResponse::success(experiments)))
}

pub async fn get_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SplitrunError> {
    let experiment = state.state_machine.get_experiment(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn list_experiment_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SplitrunError> {
    let events = state.state_machine.list_events(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(events)))
}

pub async fn start_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SplitrunError> {
    let experiment = state.state_machine.start_experiment(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

pub async fn stop_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SplitrunError> {
    let experiment = state.state_machine.stop_experiment(ExperimentId(id)).await?;
    Ok(Json(ApiResponse::success(experiment)))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub phase: String,
}

pub async fn transition_experiment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, SplitrunError> {
    let phase = ExperimentPhase::parse(&req.phase)?;
    let experiment = state
        .state_machine
        .transition_experiment(ExperimentId(id), phase)
        .await?;
    Ok(Json(ApiResponse::success(experiment)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub host_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub action: String,
    pub experiment_id: Option<Uuid>,
    pub config: Option<serde_json::Value>,
    pub priority: Option<i32>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, SplitrunError> {
    if req.host_id.trim().is_empty() {
        return Err(SplitrunError::validation("Task host_id cannot be empty"));
    }
    if req.task_type.trim().is_empty() || req.action.trim().is_empty() {
        return Err(SplitrunError::validation("Task type and action are required"));
    }

    let mut task = Task::new(req.host_id, req.task_type, req.action);
    if let Some(experiment_id) = req.experiment_id {
        task = task.with_experiment(ExperimentId(experiment_id));
    }
    if let Some(config) = req.config {
        task = task.with_config(config);
    }
    if let Some(priority) = req.priority {
        task = task.with_priority(priority);
    }

    let task = state.queue.enqueue(task).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(task))))
}

pub async fn get_task_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, SplitrunError> {
    let stats = state.queue.stats().await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "pending": stats.pending,
        "assigned": stats.assigned,
        "running": stats.running,
        "completed": stats.completed,
        "failed": stats.failed,
        "cancelled": stats.cancelled,
        "total": stats.total(),
    }))))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SplitrunError> {
    let task = state.queue.get_task(TaskId(id)).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// Body of an agent's result callback.
#[derive(Debug, Deserialize)]
pub struct TaskStatusReport {
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

pub async fn report_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<TaskStatusReport>,
) -> Result<impl IntoResponse, SplitrunError> {
    let status = TaskStatus::parse(&report.status)?;
    let task = state
        .queue
        .update_task_status_with_result(TaskId(id), status, report.result, report.error_message)
        .await?;
    Ok(Json(ApiResponse::success(task)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Agent Long-poll
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    pub timeout_secs: Option<u64>,
}

/// Park until work exists for `host_id` or the timeout elapses.
///
/// The body is always a bare JSON array; an empty array means no work.
pub async fn poll_tasks(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Query(params): Query<PollParams>,
) -> Result<Json<Vec<Task>>, SplitrunError> {
    let cap = state.config.server.long_poll_timeout;
    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .map_or(cap, |requested| requested.min(cap));

    debug!(host_id = %host_id, timeout = ?timeout, "Agent long-poll");
    let tasks = state
        .queue
        .get_pending_tasks(&host_id, timeout, &state.shutdown)
        .await?;
    Ok(Json(tasks))
}
