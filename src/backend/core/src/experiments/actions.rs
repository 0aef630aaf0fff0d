//! Phase-entry actions.
//!
//! Each non-terminal phase owns at most one background routine, run by the
//! supervisor under that phase's cancellation token. Routines only request
//! further transitions through `transition_if`, so a routine whose phase has
//! already been left can never move the experiment.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::experiment::{EventType, Experiment, ExperimentEvent, ExperimentPhase};
use super::state_machine::ExperimentStateMachine;
use crate::error::ErrorCode;
use crate::tasks::{Task, TaskStatus, ACTION_START};

/// Progress of the collector start tasks for one experiment.
#[derive(Debug, PartialEq)]
enum Deployment {
    InProgress { completed: usize, total: usize },
    Ready { total: usize },
    Failed { task: Box<Task> },
}

fn deployment_status(tasks: &[Task]) -> Deployment {
    let start_tasks: Vec<&Task> = tasks.iter().filter(|t| t.is_collector(ACTION_START)).collect();

    if let Some(failed) = start_tasks.iter().find(|t| t.status == TaskStatus::Failed) {
        return Deployment::Failed {
            task: Box::new((*failed).clone()),
        };
    }

    let total = start_tasks.len();
    let completed = start_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();

    if total > 0 && completed == total {
        Deployment::Ready { total }
    } else {
        Deployment::InProgress { completed, total }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl ExperimentStateMachine {
    pub(super) async fn run_phase_action(self: Arc<Self>, experiment: Experiment, token: CancellationToken) {
        let id = experiment.id;
        let phase = experiment.phase;
        debug!(experiment_id = %id, phase = %phase, "Phase action started");

        match phase {
            ExperimentPhase::Initializing => self.monitor_deployment(&experiment, &token).await,
            ExperimentPhase::Running => self.run_collection(&experiment, &token).await,
            ExperimentPhase::Analyzing => self.analyze(&experiment, &token).await,
            ExperimentPhase::Stopping => self.stop_collection(&experiment, &token).await,
            // Tasks for `deploying` are enqueued by the caller that requested it.
            ExperimentPhase::Pending | ExperimentPhase::Deploying => {}
            ExperimentPhase::Completed | ExperimentPhase::Stopped | ExperimentPhase::Failed => {}
        }

        if token.is_cancelled() {
            debug!(experiment_id = %id, phase = %phase, "Phase action superseded");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // initializing
    // ─────────────────────────────────────────────────────────────────────────

    async fn monitor_deployment(&self, experiment: &Experiment, token: &CancellationToken) {
        let id = experiment.id;
        let deadline = Instant::now() + self.config.deployment_timeout;
        let mut ticker = tokio::time::interval(self.config.deployment_poll_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(experiment_id = %id, timeout = ?self.config.deployment_timeout, "Deployment timed out");
                    self.record_event(ExperimentEvent::new(
                        id,
                        EventType::DeploymentTimeout,
                        ExperimentPhase::Initializing,
                        format!(
                            "Deployment did not complete within {:?}",
                            self.config.deployment_timeout
                        ),
                    ))
                    .await;
                    self.fail_from(experiment, ExperimentPhase::Initializing).await;
                    return;
                }
                _ = ticker.tick() => {}
            }

            let tasks = match self.queue.get_tasks_by_experiment(id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(experiment_id = %id, error = %e, "Deployment monitor failed to load tasks");
                    continue;
                }
            };

            match deployment_status(&tasks) {
                Deployment::InProgress { completed, total } => {
                    debug!(experiment_id = %id, completed, total, "Deployment in progress");
                }
                Deployment::Failed { task } => {
                    error!(
                        experiment_id = %id,
                        task_id = %task.id,
                        host_id = %task.host_id,
                        error = ?task.error_message,
                        "Deployment task failed"
                    );
                    self.record_event(
                        ExperimentEvent::new(
                            id,
                            EventType::DeploymentFailed,
                            ExperimentPhase::Initializing,
                            format!("Deployment failed on host {}", task.host_id),
                        )
                        .with_metadata(serde_json::json!({
                            "task_id": task.id,
                            "host_id": task.host_id,
                            "error_message": task.error_message,
                        })),
                    )
                    .await;
                    self.fail_from(experiment, ExperimentPhase::Initializing).await;
                    return;
                }
                Deployment::Ready { total } => {
                    info!(experiment_id = %id, hosts = total, "Deployment complete, stabilizing");
                    if !sleep_or_cancel(token, self.config.stabilization_delay).await {
                        return;
                    }
                    self.advance(experiment, ExperimentPhase::Initializing, ExperimentPhase::Running)
                        .await;
                    return;
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // running
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_collection(&self, experiment: &Experiment, token: &CancellationToken) {
        let id = experiment.id;

        self.record_event(ExperimentEvent::new(
            id,
            EventType::MetricsCollectionStarted,
            ExperimentPhase::Running,
            "Metrics collection started",
        ))
        .await;

        if let Err(e) = self.collector.start_collection(experiment).await {
            warn!(experiment_id = %id, error = %e, "Collector did not acknowledge start");
        }

        let Some(duration) = experiment.config.duration.filter(|d| !d.is_zero()) else {
            debug!(experiment_id = %id, "No fixed duration, running until stopped");
            return;
        };

        if !sleep_or_cancel(token, duration).await {
            return;
        }

        match self.load(id).await {
            Ok(current) if current.phase == ExperimentPhase::Running => {}
            Ok(current) => {
                debug!(experiment_id = %id, phase = %current.phase, "Duration elapsed after experiment left running");
                return;
            }
            Err(e) => {
                warn!(experiment_id = %id, error = %e, "Failed to reload experiment at deadline");
                return;
            }
        }

        info!(experiment_id = %id, duration = ?duration, "Experiment duration elapsed");
        if let Err(e) = self.collector.stop_collection(experiment).await {
            warn!(experiment_id = %id, error = %e, "Collector did not acknowledge stop");
        }

        if !sleep_or_cancel(token, self.config.stop_grace).await {
            return;
        }
        self.advance(experiment, ExperimentPhase::Running, ExperimentPhase::Analyzing)
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // analyzing
    // ─────────────────────────────────────────────────────────────────────────

    async fn analyze(&self, experiment: &Experiment, token: &CancellationToken) {
        let id = experiment.id;

        if !sleep_or_cancel(token, self.config.metrics_flush_grace).await {
            return;
        }

        let computed = tokio::select! {
            _ = token.cancelled() => return,
            result = self.collector.compute_kpis(experiment) => result,
        };

        let outcome = match computed {
            Ok(results) => self
                .store
                .update_experiment_results(id, &results)
                .await
                .map(|()| results),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(results) => {
                info!(experiment_id = %id, "Analysis completed");
                let payload = serde_json::to_value(&results).unwrap_or_default();
                self.record_event(
                    ExperimentEvent::new(
                        id,
                        EventType::AnalysisCompleted,
                        ExperimentPhase::Analyzing,
                        "KPI analysis completed",
                    )
                    .with_metadata(payload.clone()),
                )
                .await;
                self.hub.broadcast_metric_update(id, payload);

                if !sleep_or_cancel(token, self.config.results_publish_delay).await {
                    return;
                }
                self.advance(experiment, ExperimentPhase::Analyzing, ExperimentPhase::Completed)
                    .await;
            }
            Err(e) => {
                error!(experiment_id = %id, error = %e, "Analysis failed");
                self.record_event(
                    ExperimentEvent::new(
                        id,
                        EventType::AnalysisFailed,
                        ExperimentPhase::Analyzing,
                        format!("KPI analysis failed: {}", e.user_message()),
                    )
                    .with_metadata(serde_json::json!({ "error_code": e.code() })),
                )
                .await;
                self.fail_from(experiment, ExperimentPhase::Analyzing).await;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // stopping
    // ─────────────────────────────────────────────────────────────────────────

    async fn stop_collection(&self, experiment: &Experiment, token: &CancellationToken) {
        let id = experiment.id;

        let stopped = tokio::select! {
            _ = token.cancelled() => return,
            result = self.collector.stop_collection(experiment) => result,
        };
        if let Err(e) = stopped {
            warn!(experiment_id = %id, error = %e, "Collector did not acknowledge stop");
        }

        self.advance(experiment, ExperimentPhase::Stopping, ExperimentPhase::Stopped)
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // stopped / failed
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel every task of the experiment that has not finished.
    pub(super) async fn run_cleanup(self: Arc<Self>, experiment: Experiment, token: CancellationToken) {
        let id = experiment.id;

        let tasks = tokio::select! {
            _ = token.cancelled() => return,
            tasks = self.queue.get_tasks_by_experiment(id) => tasks,
        };
        let tasks = match tasks {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(experiment_id = %id, error = %e, "Cleanup failed to load tasks");
                return;
            }
        };

        let mut cancelled = 0;
        for task in tasks.iter().filter(|t| {
            matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running
            )
        }) {
            match self.queue.update_task_status(task.id, TaskStatus::Cancelled).await {
                Ok(_) => cancelled += 1,
                Err(e) if e.code() == ErrorCode::InvalidTaskTransition => {
                    debug!(experiment_id = %id, task_id = %task.id, "Task finished before cleanup reached it");
                }
                Err(e) => warn!(experiment_id = %id, task_id = %task.id, error = %e, "Failed to cancel task"),
            }
        }

        self.record_event(
            ExperimentEvent::new(
                id,
                EventType::CleanupCompleted,
                experiment.phase,
                format!("Cleanup cancelled {} task(s)", cancelled),
            )
            .with_metadata(serde_json::json!({ "cancelled_tasks": cancelled })),
        )
        .await;
        info!(experiment_id = %id, phase = %experiment.phase, cancelled, "Experiment cleanup completed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn advance(&self, experiment: &Experiment, from: ExperimentPhase, to: ExperimentPhase) {
        if let Err(e) = self.transition_if(experiment.id, from, to).await {
            error!(
                experiment_id = %experiment.id,
                from = %from,
                to = %to,
                error = %e,
                "Phase action failed to transition experiment"
            );
        }
    }

    async fn fail_from(&self, experiment: &Experiment, from: ExperimentPhase) {
        self.advance(experiment, from, ExperimentPhase::Failed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ACTION_STOP;

    fn start_task(status: TaskStatus) -> Task {
        let mut task = Task::new("h1", "collector", ACTION_START);
        task.status = status;
        task
    }

    #[test]
    fn test_deployment_status_waits_for_all() {
        let tasks = vec![start_task(TaskStatus::Completed), start_task(TaskStatus::Running)];
        assert_eq!(
            deployment_status(&tasks),
            Deployment::InProgress { completed: 1, total: 2 }
        );
    }

    #[test]
    fn test_deployment_status_ready() {
        let mut tasks = vec![start_task(TaskStatus::Completed), start_task(TaskStatus::Completed)];
        // unrelated tasks do not count
        tasks.push(Task::new("h1", "collector", ACTION_STOP));
        assert_eq!(deployment_status(&tasks), Deployment::Ready { total: 2 });
    }

    #[test]
    fn test_deployment_status_empty_is_not_ready() {
        assert_eq!(
            deployment_status(&[]),
            Deployment::InProgress { completed: 0, total: 0 }
        );
    }

    #[test]
    fn test_deployment_status_any_failure() {
        let tasks = vec![start_task(TaskStatus::Completed), start_task(TaskStatus::Failed)];
        assert!(matches!(deployment_status(&tasks), Deployment::Failed { .. }));
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(&token, Duration::from_millis(5)).await);
        token.cancel();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(60)).await);
    }
}
