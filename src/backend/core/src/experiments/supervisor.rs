//! Phase supervisor.
//!
//! A single task consumes `PhaseEntered` work items in the order the state
//! machine produced them and owns the cancellation tree for every experiment:
//!
//! ```text
//! shutdown
//!   └── experiment root      (created on entry to `deploying`)
//!         └── phase token    (one per non-terminal phase, cancelled on exit)
//! ```
//!
//! Entering any phase cancels the previous phase's token, so a timer or
//! monitor left over from a superseded phase observes cancellation before
//! it can request another transition. Terminal phases cancel the root.
//! Cleanup for `stopped` and `failed` runs under a fresh child of the
//! shutdown token so it is not cut short by the root it just cancelled.

use std::collections::HashMap;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::experiment::{Experiment, ExperimentId, ExperimentPhase};
use super::state_machine::ExperimentStateMachine;

/// Work item: an experiment has just entered `experiment.phase`.
#[derive(Debug)]
pub(super) struct PhaseEntered {
    pub experiment: Experiment,
}

struct Lifecycle {
    root: CancellationToken,
    phase: Option<CancellationToken>,
}

pub(super) struct Supervisor {
    machine: Weak<ExperimentStateMachine>,
    rx: mpsc::UnboundedReceiver<PhaseEntered>,
    shutdown: CancellationToken,
    lifecycles: HashMap<ExperimentId, Lifecycle>,
}

impl Supervisor {
    pub fn new(
        machine: Weak<ExperimentStateMachine>,
        rx: mpsc::UnboundedReceiver<PhaseEntered>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            machine,
            rx,
            shutdown,
            lifecycles: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => self.handle(item),
                    None => break,
                },
            }
        }

        for (_, lifecycle) in self.lifecycles.drain() {
            lifecycle.root.cancel();
        }
        info!("Phase supervisor stopped");
    }

    fn handle(&mut self, item: PhaseEntered) {
        let experiment = item.experiment;
        let id = experiment.id;
        let phase = experiment.phase;

        // Whatever ran for the previous phase is now superseded.
        if let Some(previous) = self
            .lifecycles
            .get_mut(&id)
            .and_then(|lifecycle| lifecycle.phase.take())
        {
            previous.cancel();
        }

        let Some(machine) = self.machine.upgrade() else {
            return;
        };

        if phase.is_terminal() {
            if let Some(lifecycle) = self.lifecycles.remove(&id) {
                lifecycle.root.cancel();
            }
            debug!(experiment_id = %id, phase = %phase, "Experiment lifecycle finished");

            if matches!(phase, ExperimentPhase::Stopped | ExperimentPhase::Failed) {
                let token = self.shutdown.child_token();
                tokio::spawn(machine.run_cleanup(experiment, token));
            }
            return;
        }

        if phase == ExperimentPhase::Deploying {
            if let Some(stale) = self.lifecycles.remove(&id) {
                stale.root.cancel();
            }
        }

        let shutdown = &self.shutdown;
        let lifecycle = self.lifecycles.entry(id).or_insert_with(|| Lifecycle {
            root: shutdown.child_token(),
            phase: None,
        });

        let token = lifecycle.root.child_token();
        lifecycle.phase = Some(token.clone());
        tokio::spawn(machine.run_phase_action(experiment, token));
    }
}
