//! Experiment state machine.
//!
//! Every phase change goes through [`ExperimentStateMachine::transition_experiment`]
//! (or its conditional variant used by phase actions). A transition:
//!
//! 1. takes the experiment's in-process lock
//! 2. validates the edge against the transition table
//! 3. persists it with a conditional update on the observed phase
//! 4. appends a `phase_transition` event (failures are logged only)
//! 5. publishes an `experiment_update` and hands the entered phase to the
//!    supervisor, which runs the phase's background action

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::experiment::{
    EventType, Experiment, ExperimentEvent, ExperimentId, ExperimentPhase, NewExperiment,
};
use super::supervisor::{PhaseEntered, Supervisor};
use crate::collector::MetricsCollector;
use crate::config::LifecycleConfig;
use crate::error::{Result, SplitrunError};
use crate::hub::NotificationHub;
use crate::observability::metrics as lifecycle_metrics;
use crate::store::Store;
use crate::tasks::{Task, TaskQueue, ACTION_START, COLLECTOR_TASK_TYPE};

/// Drives experiments through their lifecycle.
pub struct ExperimentStateMachine {
    pub(super) store: Arc<dyn Store>,
    pub(super) queue: Arc<TaskQueue>,
    pub(super) hub: Arc<NotificationHub>,
    pub(super) collector: Arc<dyn MetricsCollector>,
    pub(super) config: LifecycleConfig,
    locks: DashMap<ExperimentId, Arc<tokio::sync::Mutex<()>>>,
    supervisor_tx: mpsc::UnboundedSender<PhaseEntered>,
    shutdown: CancellationToken,
}

impl ExperimentStateMachine {
    /// Create the state machine and spawn its phase supervisor.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        hub: Arc<NotificationHub>,
        collector: Arc<dyn MetricsCollector>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|machine| {
            let supervisor = Supervisor::new(machine.clone(), supervisor_rx, shutdown.clone());
            tokio::spawn(supervisor.run());

            Self {
                store,
                queue,
                hub,
                collector,
                config,
                locks: DashMap::new(),
                supervisor_tx,
                shutdown,
            }
        })
    }

    /// Stop the supervisor and cancel every running phase action.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate and persist a new experiment in `pending`.
    pub async fn create_experiment(&self, request: NewExperiment) -> Result<Experiment> {
        request.validate()?;

        let experiment = Experiment::new(request);
        self.store.create_experiment(&experiment).await?;

        self.record_event(
            ExperimentEvent::new(
                experiment.id,
                EventType::Created,
                experiment.phase,
                format!("Experiment '{}' created", experiment.name),
            )
            .with_metadata(serde_json::json!({
                "target_hosts": experiment.config.target_hosts,
            })),
        )
        .await;

        self.hub.broadcast_experiment_update(
            experiment.id,
            serde_json::json!({
                "experiment_id": experiment.id,
                "from": null,
                "to": experiment.phase,
                "phase": experiment.phase,
            }),
        );

        info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            hosts = experiment.config.target_hosts.len(),
            "Experiment created"
        );
        Ok(experiment)
    }

    /// Deploy a pending experiment: enter `deploying`, enqueue one collector
    /// start task per target host, then enter `initializing`.
    pub async fn start_experiment(&self, id: ExperimentId) -> Result<Experiment> {
        let experiment = self.transition_experiment(id, ExperimentPhase::Deploying).await?;

        for host_id in &experiment.config.target_hosts {
            let task = Task::new(host_id, COLLECTOR_TASK_TYPE, ACTION_START)
                .with_experiment(id)
                .with_config(serde_json::json!({
                    "experiment_id": id,
                    "host_id": host_id,
                    "baseline_pipeline": experiment.config.baseline_pipeline,
                    "candidate_pipeline": experiment.config.candidate_pipeline,
                }));

            if let Err(e) = self.queue.enqueue(task).await {
                error!(experiment_id = %id, host_id = %host_id, error = %e, "Failed to enqueue deployment task");
                self.record_event(ExperimentEvent::new(
                    id,
                    EventType::DeploymentFailed,
                    ExperimentPhase::Deploying,
                    format!("Failed to enqueue deployment task for {}: {}", host_id, e),
                ))
                .await;
                self.transition_if(id, ExperimentPhase::Deploying, ExperimentPhase::Failed)
                    .await?;
                return Err(e);
            }
        }

        self.transition_experiment(id, ExperimentPhase::Initializing)
            .await
    }

    /// Ask a running experiment to stop early.
    pub async fn stop_experiment(&self, id: ExperimentId) -> Result<Experiment> {
        self.transition_experiment(id, ExperimentPhase::Stopping).await
    }

    /// Move an experiment to `to` from whatever phase it is in now.
    ///
    /// Fails with `InvalidTransition` when the edge is not in the table; the
    /// stored phase is then left untouched.
    pub async fn transition_experiment(
        &self,
        id: ExperimentId,
        to: ExperimentPhase,
    ) -> Result<Experiment> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let experiment = self.load(id).await?;
        self.apply_transition(experiment, to).await
    }

    /// Move an experiment from `from` to `to` only if it is still in `from`.
    /// Returns `None` when it has already moved on.
    pub async fn transition_if(
        &self,
        id: ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<Option<Experiment>> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let experiment = self.load(id).await?;
        if experiment.phase != from {
            debug!(
                experiment_id = %id,
                expected = %from,
                actual = %experiment.phase,
                "Skipping transition, experiment already moved on"
            );
            return Ok(None);
        }
        self.apply_transition(experiment, to).await.map(Some)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_experiment(&self, id: ExperimentId) -> Result<Experiment> {
        self.load(id).await
    }

    pub async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.store.list_experiments().await
    }

    pub async fn list_events(&self, id: ExperimentId) -> Result<Vec<ExperimentEvent>> {
        self.load(id).await?;
        self.store.list_experiment_events(id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════════

    fn lock_for(&self, id: ExperimentId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(super) async fn load(&self, id: ExperimentId) -> Result<Experiment> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or_else(|| SplitrunError::experiment_not_found(id))
    }

    /// Caller holds the experiment lock.
    async fn apply_transition(
        &self,
        experiment: Experiment,
        to: ExperimentPhase,
    ) -> Result<Experiment> {
        let id = experiment.id;
        let from = experiment.phase;

        if !from.can_transition_to(to) {
            return Err(SplitrunError::invalid_transition(from, to)
                .with_context("experiment_id", id.to_string()));
        }

        let updated = self.store.update_experiment_phase(id, from, to).await?;

        self.record_event(
            ExperimentEvent::new(
                id,
                EventType::PhaseTransition,
                to,
                format!("Phase changed from {} to {}", from, to),
            )
            .with_metadata(serde_json::json!({ "from": from, "to": to })),
        )
        .await;

        lifecycle_metrics::record_transition(from.as_str(), to.as_str());
        self.hub.broadcast_experiment_update(
            id,
            serde_json::json!({
                "experiment_id": id,
                "from": from,
                "to": to,
                "phase": to,
            }),
        );

        if self
            .supervisor_tx
            .send(PhaseEntered {
                experiment: updated.clone(),
            })
            .is_err()
        {
            warn!(experiment_id = %id, phase = %to, "Phase supervisor stopped, no action dispatched");
        }

        if to.is_terminal() {
            self.locks.remove(&id);
        }

        info!(experiment_id = %id, from = %from, to = %to, "Experiment phase transition");
        Ok(updated)
    }

    /// Append an audit event. Never fails the caller.
    pub(super) async fn record_event(&self, event: ExperimentEvent) {
        if let Err(e) = self.store.create_experiment_event(&event).await {
            warn!(
                experiment_id = %event.experiment_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to record experiment event"
            );
        }
    }
}
