//! Background maintenance: stale-task reaping and aged-task cleanup.

use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::TaskQueue;
use super::task::TaskStatus;
use crate::error::ErrorCode;
use crate::observability::metrics as queue_metrics;

/// Message recorded on tasks forced to `failed` by the reaper.
pub const STALE_TASK_MESSAGE: &str = "Task timed out";

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reaped: u64,
    pub cleaned: u64,
}

/// Handle for controlling the running maintenance loop.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the loop to stop after its current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.join.await;
    }
}

impl TaskQueue {
    /// Start the periodic maintenance loop.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let queue = Arc::clone(self);
        let period = self.config.maintenance_interval;

        let join = tokio::spawn(async move {
            info!(interval = ?period, "Task maintenance started");
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = queue.run_maintenance_once().await;
                        if report.reaped > 0 || report.cleaned > 0 {
                            info!(reaped = report.reaped, cleaned = report.cleaned, "Task maintenance pass");
                        }
                    }
                }
            }

            info!("Task maintenance stopped");
        });

        MaintenanceHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One reap-then-cleanup pass. Failures are logged; the pass never errors.
    pub async fn run_maintenance_once(&self) -> MaintenanceReport {
        MaintenanceReport {
            reaped: self.reap_stale_tasks().await,
            cleaned: self.cleanup_old_tasks().await,
        }
    }

    async fn reap_stale_tasks(&self) -> u64 {
        let threshold = match chrono::Duration::from_std(self.config.stale_threshold) {
            Ok(d) => chrono::Utc::now() - d,
            Err(e) => {
                error!(error = %e, "Invalid stale threshold");
                return 0;
            }
        };

        let stale = match self.store.get_stale_tasks(threshold).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to query stale tasks");
                return 0;
            }
        };

        let mut reaped = 0;
        for task in stale {
            // The row may have moved on since the snapshot; the store checks
            // the lifecycle again under its lock.
            match self
                .apply_report(
                    task.id,
                    TaskStatus::Failed,
                    None,
                    Some(STALE_TASK_MESSAGE.to_string()),
                )
                .await
            {
                Ok(change) if change.applied() => {
                    reaped += 1;
                    warn!(
                        task_id = %task.id,
                        host_id = %task.host_id,
                        status = %change.previous,
                        last_update = %task.updated_at,
                        "Reaped stale task"
                    );
                }
                Ok(_) => {
                    debug!(task_id = %task.id, "Stale task already failed");
                }
                Err(e) if e.code() == ErrorCode::InvalidTaskTransition => {
                    debug!(task_id = %task.id, error = %e, "Stale task finished before reaping");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to reap stale task");
                }
            }
        }

        counter!(queue_metrics::TASKS_REAPED).increment(reaped);
        reaped
    }

    async fn cleanup_old_tasks(&self) -> u64 {
        let cutoff = match chrono::Duration::from_std(self.config.retention) {
            Ok(d) => chrono::Utc::now() - d,
            Err(e) => {
                error!(error = %e, "Invalid task retention");
                return 0;
            }
        };

        match self.store.delete_old_tasks(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    debug!(deleted, cutoff = %cutoff, "Deleted aged tasks");
                }
                counter!(queue_metrics::TASKS_CLEANED).increment(deleted);
                deleted
            }
            Err(e) => {
                warn!(error = %e, "Failed to delete aged tasks");
                0
            }
        }
    }
}
