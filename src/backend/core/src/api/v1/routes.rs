//! V1 API routes for Splitrun.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// All routes are mounted under `/api/v1/`.
///
/// # Endpoints
///
/// ## Experiments
/// - `POST /experiments` - Create an experiment in `pending`
/// - `GET /experiments` - List experiments
/// - `GET /experiments/:id` - Get experiment by ID
/// - `GET /experiments/:id/events` - Audit log, oldest first
/// - `POST /experiments/:id/start` - Deploy to the target hosts
/// - `POST /experiments/:id/stop` - Stop a running experiment
/// - `POST /experiments/:id/transition` - Request an explicit phase change
///
/// ## Tasks
/// - `POST /tasks` - Enqueue a task directly
/// - `GET /tasks/stats` - Task counts per status
/// - `GET /tasks/:id` - Get task by ID
/// - `POST /tasks/:id/status` - Agent result callback
///
/// ## Agents
/// - `GET /agents/:host_id/tasks` - Long-poll for pending work
pub fn v1_router() -> Router<AppState> {
    Router::new()
        // Experiment endpoints
        .route(
            "/experiments",
            post(handlers::create_experiment).get(handlers::list_experiments),
        )
        .route("/experiments/:id", get(handlers::get_experiment))
        .route("/experiments/:id/events", get(handlers::list_experiment_events))
        .route("/experiments/:id/start", post(handlers::start_experiment))
        .route("/experiments/:id/stop", post(handlers::stop_experiment))
        .route("/experiments/:id/transition", post(handlers::transition_experiment))
        // Task endpoints
        .route("/tasks", post(handlers::create_task))
        .route("/tasks/stats", get(handlers::get_task_stats))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/status", post(handlers::report_task_status))
        // Agent endpoints
        .route("/agents/:host_id/tasks", get(handlers::poll_tasks))
}
