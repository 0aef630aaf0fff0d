//! Experiment model and the phase transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SplitrunError};

// ═══════════════════════════════════════════════════════════════════════════════
// Experiment Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Uuid);

impl ExperimentId {
    /// Create a new random experiment ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ExperimentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Experiment Phase
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle phase of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Pending,
    Deploying,
    Initializing,
    Running,
    Analyzing,
    Completed,
    Stopping,
    Stopped,
    Failed,
}

impl ExperimentPhase {
    pub const ALL: [ExperimentPhase; 9] = [
        Self::Pending,
        Self::Deploying,
        Self::Initializing,
        Self::Running,
        Self::Analyzing,
        Self::Completed,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Parse a phase name.
    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| SplitrunError::validation(format!("Unknown experiment phase: {}", s)))
    }

    /// Check if the phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Check if a transition to `next` is in the transition table.
    pub fn can_transition_to(&self, next: ExperimentPhase) -> bool {
        use ExperimentPhase::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Deploying, Initializing)
                | (Deploying, Failed)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Analyzing)
                | (Running, Stopping)
                | (Running, Failed)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    /// Phases reachable from this one.
    pub fn allowed_transitions(&self) -> Vec<ExperimentPhase> {
        Self::ALL
            .into_iter()
            .filter(|next| self.can_transition_to(*next))
            .collect()
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Thresholds the candidate must satisfy relative to the baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_overhead_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_overhead_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cardinality_reduction_pct: Option<f64>,
}

/// What an experiment compares and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Pipeline reference deployed as the control
    pub baseline_pipeline: String,
    /// Pipeline reference under test
    pub candidate_pipeline: String,
    /// Agent hosts that run both variants
    pub target_hosts: Vec<String>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    /// Fixed run length. When absent the experiment runs until stopped.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregate KPIs for one variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub cardinality: u64,
    pub cpu_overhead_pct: f64,
    pub memory_overhead_mb: f64,
    pub error_rate: f64,
}

/// Baseline vs candidate KPIs computed at analysis time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub baseline: VariantMetrics,
    pub candidate: VariantMetrics,
    pub computed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Experiment
// ═══════════════════════════════════════════════════════════════════════════════

/// Request to create an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: ExperimentConfig,
}

impl NewExperiment {
    /// Reject requests that could never run.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SplitrunError::validation("Experiment name cannot be empty"));
        }
        if self.config.target_hosts.is_empty() {
            return Err(SplitrunError::validation(
                "Experiment needs at least one target host",
            ));
        }
        if self.config.target_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(SplitrunError::validation("Target host ids cannot be empty"));
        }
        if self.config.baseline_pipeline == self.config.candidate_pipeline {
            return Err(SplitrunError::validation(
                "Baseline and candidate pipelines must differ",
            ));
        }
        Ok(())
    }
}

/// An A/B comparison between two pipeline variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub description: String,
    pub phase: ExperimentPhase,
    pub config: ExperimentConfig,
    pub results: Option<ExperimentResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Build a pending experiment from a validated request.
    pub fn new(request: NewExperiment) -> Self {
        let now = Utc::now();
        Self {
            id: ExperimentId::new(),
            name: request.name,
            description: request.description,
            phase: ExperimentPhase::Pending,
            config: request.config,
            results: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a phase change, stamping lifecycle timestamps.
    pub fn enter_phase(&mut self, phase: ExperimentPhase) {
        let now = Utc::now();
        self.phase = phase;
        self.updated_at = now;
        if phase == ExperimentPhase::Running {
            self.started_at = Some(now);
        }
        if phase.is_terminal() {
            self.completed_at = Some(now);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    PhaseTransition,
    DeploymentFailed,
    DeploymentTimeout,
    MetricsCollectionStarted,
    AnalysisCompleted,
    AnalysisFailed,
    CleanupCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PhaseTransition => "phase_transition",
            Self::DeploymentFailed => "deployment_failed",
            Self::DeploymentTimeout => "deployment_timeout",
            Self::MetricsCollectionStarted => "metrics_collection_started",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisFailed => "analysis_failed",
            Self::CleanupCompleted => "cleanup_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Created,
            Self::PhaseTransition,
            Self::DeploymentFailed,
            Self::DeploymentTimeout,
            Self::MetricsCollectionStarted,
            Self::AnalysisCompleted,
            Self::AnalysisFailed,
            Self::CleanupCompleted,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: Uuid,
    pub experiment_id: ExperimentId,
    pub event_type: EventType,
    pub phase: ExperimentPhase,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ExperimentEvent {
    pub fn new(
        experiment_id: ExperimentId,
        event_type: EventType,
        phase: ExperimentPhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            event_type,
            phase,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NewExperiment {
        NewExperiment {
            name: "drop debug attributes".to_string(),
            description: String::new(),
            config: ExperimentConfig {
                baseline_pipeline: "pipelines/baseline.yaml".to_string(),
                candidate_pipeline: "pipelines/candidate.yaml".to_string(),
                target_hosts: vec!["host-a".to_string(), "host-b".to_string()],
                success_criteria: SuccessCriteria::default(),
                duration: Some(Duration::from_secs(600)),
            },
        }
    }

    #[test]
    fn test_transition_table() {
        use ExperimentPhase::*;
        let edges = [
            (Pending, vec![Deploying]),
            (Deploying, vec![Initializing, Failed]),
            (Initializing, vec![Running, Failed]),
            (Running, vec![Analyzing, Failed, Stopping]),
            (Analyzing, vec![Completed, Failed]),
            (Stopping, vec![Stopped, Failed]),
            (Completed, vec![]),
            (Stopped, vec![]),
            (Failed, vec![]),
        ];

        for (from, allowed) in edges {
            for to in ExperimentPhase::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_no_self_loops() {
        for phase in ExperimentPhase::ALL {
            assert!(!phase.can_transition_to(phase));
        }
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for phase in ExperimentPhase::ALL.into_iter().filter(|p| p.is_terminal()) {
            assert!(phase.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!(ExperimentPhase::parse("analyzing").unwrap(), ExperimentPhase::Analyzing);
        assert!(ExperimentPhase::parse("paused").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(request().validate().is_ok());

        let mut blank = request();
        blank.name = "  ".to_string();
        assert!(blank.validate().is_err());

        let mut no_hosts = request();
        no_hosts.config.target_hosts.clear();
        assert!(no_hosts.validate().is_err());

        let mut same = request();
        same.config.candidate_pipeline = same.config.baseline_pipeline.clone();
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_enter_phase_timestamps() {
        let mut experiment = Experiment::new(request());
        experiment.enter_phase(ExperimentPhase::Running);
        assert!(experiment.started_at.is_some());
        assert!(experiment.completed_at.is_none());

        experiment.enter_phase(ExperimentPhase::Stopped);
        assert!(experiment.completed_at.is_some());
    }

    #[test]
    fn test_duration_is_human_readable() {
        let json = serde_json::json!({
            "baseline_pipeline": "a",
            "candidate_pipeline": "b",
            "target_hosts": ["h1"],
            "duration": "15m"
        });
        let config: ExperimentConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.duration, Some(Duration::from_secs(900)));
    }
}
