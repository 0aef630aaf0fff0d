//! HTTP API layer for Splitrun.
//!
//! - Unversioned: `/health`, `/metrics` and the observer websocket `/ws`
//! - V1 under `/api/v1/`: experiments, task callbacks and the agent long-poll
//!
//! Handlers return `Result<impl IntoResponse, SplitrunError>`; errors render
//! through the error type's `IntoResponse` implementation.

mod handlers;
pub mod v1;
mod websocket;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::experiments::ExperimentStateMachine;
use crate::hub::NotificationHub;
use crate::store::Store;
use crate::tasks::TaskQueue;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub state_machine: Arc<ExperimentStateMachine>,
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<NotificationHub>,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    /// Present when the Prometheus recorder was installed.
    pub prometheus: Option<PrometheusHandle>,
    /// Cancelled on server shutdown; releases parked long-polls.
    pub shutdown: CancellationToken,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/ws", get(websocket::ws_handler))
        .nest(v1::V1_PREFIX, v1::v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }
}
