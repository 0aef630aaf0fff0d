#![allow(clippy::result_large_err)]
//! # Splitrun Core
//!
//! Control plane for running A/B experiments of observability pipelines
//! across a fleet of agent hosts.
//!
//! ## Architecture
//!
//! - **Experiments**: phase state machine with supervised, cancellable phase actions
//! - **Tasks**: durable queue handed to agents by long-poll, with retry and stale reaping
//! - **Hub**: topic-based fan-out of lifecycle and task events to live observers
//! - **Store**: persistence contract with in-memory and PostgreSQL backends
//! - **Collector**: boundary to the external KPI service
//! - **API**: REST endpoints, agent long-poll and the observer websocket
//! - **Observability**: structured logging, OTLP tracing and Prometheus metrics

pub mod api;
pub mod collector;
pub mod config;
pub mod error;
pub mod experiments;
pub mod hub;
pub mod observability;
pub mod store;
pub mod tasks;

pub use error::{ErrorCategory, ErrorCode, Result, SplitrunError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ErrorCode, Result, SplitrunError};
    pub use crate::experiments::{
        Experiment, ExperimentId, ExperimentPhase, ExperimentStateMachine, NewExperiment,
    };
    pub use crate::hub::{HubMessage, MessageType, NotificationHub};
    pub use crate::store::{InMemoryStore, PgStore, Store};
    pub use crate::tasks::{Task, TaskId, TaskQueue, TaskStatus};
}
