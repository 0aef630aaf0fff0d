//! Experiment lifecycle.
//!
//! An experiment compares a baseline and a candidate pipeline on a set of
//! target hosts and moves through a fixed set of phases:
//!
//! ```text
//! pending ─► deploying ─► initializing ─► running ─► analyzing ─► completed
//!                                           │
//!                                           └─► stopping ─► stopped
//! ```
//!
//! Every phase from `deploying` through `stopping` may also fall to `failed`.
//!
//! - **Experiment**: domain types, phase table and audit events
//! - **ExperimentStateMachine**: validated, persisted, published transitions
//! - **Supervisor / actions**: the background work each phase performs on entry

mod actions;
mod experiment;
mod state_machine;
mod supervisor;

pub use experiment::{
    EventType, Experiment, ExperimentConfig, ExperimentEvent, ExperimentId, ExperimentPhase,
    ExperimentResults, NewExperiment, SuccessCriteria, VariantMetrics,
};
pub use state_machine::ExperimentStateMachine;
