//! Error handling for Splitrun Core.
//!
//! Every fallible operation returns [`SplitrunError`], tagged with an
//! [`ErrorCode`]. Codes group into an [`ErrorCategory`] that decides how the
//! error is reported:
//!
//! - **Validation / NotFound**: the caller's mistake, rejected synchronously
//! - **Persistence**: store failures, propagated to the immediate caller
//! - **Collector**: the external KPI service failed or timed out
//! - **Hub**: the notification hub is no longer accepting work
//!
//! Background loops (maintenance, phase actions) log errors and carry on.
//! Transient agent failures never become errors; they are retried as tasks.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::observability::metrics::ERRORS;

/// A specialized Result type for Splitrun operations.
pub type Result<T> = std::result::Result<T, SplitrunError>;

type Context = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Categories & Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// How an error is treated by callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Persistence,
    Collector,
    Hub,
    Configuration,
}

impl ErrorCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
            Self::Collector => "collector",
            Self::Hub => "hub",
            Self::Configuration => "configuration",
        }
    }
}

/// Machine-readable error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    ValidationError,
    InvalidTransition,
    InvalidTaskStatus,
    /// A known status that the task's current status cannot move to
    InvalidTaskTransition,

    // Not found
    ExperimentNotFound,
    TaskNotFound,
    ClientNotFound,
    RecordNotFound,

    // Persistence
    ConcurrentModification,
    DuplicateRecord,
    DatabaseError,
    DatabaseUnavailable,
    SerializationError,

    // Collector
    CollectorError,
    CollectorTimeout,

    // Hub
    HubUnavailable,

    ConfigurationError,
}

impl ErrorCode {
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationError
            | Self::InvalidTransition
            | Self::InvalidTaskStatus
            | Self::InvalidTaskTransition => ErrorCategory::Validation,

            Self::ExperimentNotFound
            | Self::TaskNotFound
            | Self::ClientNotFound
            | Self::RecordNotFound => ErrorCategory::NotFound,

            Self::ConcurrentModification
            | Self::DuplicateRecord
            | Self::DatabaseError
            | Self::DatabaseUnavailable
            | Self::SerializationError => ErrorCategory::Persistence,

            Self::CollectorError | Self::CollectorTimeout => ErrorCategory::Collector,

            Self::HubUnavailable => ErrorCategory::Hub,

            Self::ConfigurationError => ErrorCategory::Configuration,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationError | Self::InvalidTaskStatus => StatusCode::UNPROCESSABLE_ENTITY,

            // Well-formed requests that lost to the current state of the record
            Self::InvalidTransition
            | Self::InvalidTaskTransition
            | Self::ConcurrentModification
            | Self::DuplicateRecord => StatusCode::CONFLICT,

            Self::ExperimentNotFound
            | Self::TaskNotFound
            | Self::ClientNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::CollectorError => StatusCode::BAD_GATEWAY,
            Self::CollectorTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::DatabaseUnavailable | Self::HubUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            Self::DatabaseError | Self::SerializationError | Self::ConfigurationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Splitrun Core.
#[derive(Error, Debug)]
#[error("[{code}] {message}")]
pub struct SplitrunError {
    code: ErrorCode,

    /// Safe to show to API clients and hub observers
    message: Cow<'static, str>,

    /// Structured fields rendered into the error body
    context: Context,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SplitrunError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            ERRORS,
            "code" => code.to_string(),
            "category" => code.category().as_str(),
        )
        .increment(1);

        Self {
            code,
            message: message.into(),
            context: Context::new(),
            source: None,
        }
    }

    fn caused_by<E>(code: ErrorCode, message: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut error = Self::new(code, message);
        error.source = Some(Box::new(source));
        error
    }

    /// Attach a structured field to the error body.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Domain constructors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn experiment_not_found(experiment_id: impl fmt::Display) -> Self {
        let id = experiment_id.to_string();
        Self::new(ErrorCode::ExperimentNotFound, format!("Experiment not found: {}", id))
            .with_context("experiment_id", id)
    }

    pub fn task_not_found(task_id: impl fmt::Display) -> Self {
        let id = task_id.to_string();
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", id))
            .with_context("task_id", id)
    }

    pub fn client_not_found(client_id: impl fmt::Display) -> Self {
        let id = client_id.to_string();
        Self::new(ErrorCode::ClientNotFound, format!("Client not found: {}", id))
            .with_context("client_id", id)
    }

    /// An experiment phase change not present in the transition table.
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        let (from, to) = (from.to_string(), to.to_string());
        Self::new(
            ErrorCode::InvalidTransition,
            format!("Invalid phase transition: {} -> {}", from, to),
        )
        .with_context("from_phase", from)
        .with_context("to_phase", to)
    }

    /// A status string no agent should send.
    pub fn invalid_task_status(status: impl Into<String>) -> Self {
        let status = status.into();
        Self::new(ErrorCode::InvalidTaskStatus, format!("Invalid task status: {}", status))
            .with_context("status", status)
    }

    /// A status report that would move a task backwards or out of a terminal status.
    pub fn invalid_task_transition(
        task_id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        let (from, to) = (from.to_string(), to.to_string());
        Self::new(
            ErrorCode::InvalidTaskTransition,
            format!("Task cannot move from {} to {}", from, to),
        )
        .with_context("task_id", task_id.to_string())
        .with_context("from_status", from)
        .with_context("to_status", to)
    }

    /// A conditional update whose precondition no longer held.
    pub fn concurrent_modification(entity_type: &str, entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConcurrentModification,
            format!("{} {} was modified concurrently", entity_type, entity_id),
        )
        .with_context("entity_type", entity_type)
        .with_context("entity_id", entity_id.to_string())
    }

    pub fn collector(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CollectorError, message.into())
    }

    pub fn hub_unavailable() -> Self {
        Self::new(ErrorCode::HubUnavailable, "Notification hub is not running")
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn user_message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Log at a level that matches who has to act on the error.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.category().as_str();
        let source = self.source.as_ref().map(|s| s.to_string());

        match (self.category(), self.code) {
            (ErrorCategory::Validation | ErrorCategory::NotFound, _) => {
                debug!(error_code = %code, category, message = %self.message, "Request rejected");
            }
            (_, ErrorCode::ConcurrentModification)
            | (ErrorCategory::Collector | ErrorCategory::Hub, _) => {
                warn!(
                    error_code = %code,
                    category,
                    message = %self.message,
                    source = ?source,
                    "Request failed"
                );
            }
            (ErrorCategory::Persistence | ErrorCategory::Configuration, _) => {
                error!(
                    error_code = %code,
                    category,
                    message = %self.message,
                    context = ?self.context,
                    source = ?source,
                    "Request failed"
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body returned to API clients, shaped like a failed `ApiResponse`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: Context,
}

impl From<&SplitrunError> for ErrorResponse {
    fn from(error: &SplitrunError) -> Self {
        Self {
            success: false,
            error: error.message.to_string(),
            error_code: error.code,
            context: error.context.clone(),
        }
    }
}

impl IntoResponse for SplitrunError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SplitrunError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => {
                (ErrorCode::RecordNotFound, "The requested record was not found")
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                (ErrorCode::DuplicateRecord, "A record with this identifier already exists")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                (ErrorCode::DatabaseUnavailable, "Unable to connect to the database")
            }
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };
        Self::caused_by(code, message, error)
    }
}

impl From<serde_json::Error> for SplitrunError {
    fn from(error: serde_json::Error) -> Self {
        Self::caused_by(ErrorCode::SerializationError, "Stored data could not be decoded", error)
    }
}

impl From<reqwest::Error> for SplitrunError {
    fn from(error: reqwest::Error) -> Self {
        let (code, message) = if error.is_timeout() {
            (ErrorCode::CollectorTimeout, "Metrics collector timed out")
        } else if error.status().is_some() {
            (ErrorCode::CollectorError, "Metrics collector returned an error")
        } else {
            (ErrorCode::CollectorError, "Metrics collector is unreachable")
        };
        Self::caused_by(code, message, error)
    }
}

impl From<config::ConfigError> for SplitrunError {
    fn from(error: config::ConfigError) -> Self {
        Self::caused_by(ErrorCode::ConfigurationError, "Configuration could not be loaded", error)
    }
}
