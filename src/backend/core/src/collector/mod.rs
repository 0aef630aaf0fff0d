//! Metrics collector boundary.
//!
//! KPI computation is owned by an external service. The lifecycle only asks
//! it to start and stop collecting for an experiment and, at analysis time,
//! to return aggregate baseline and candidate metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::CollectorConfig;
use crate::error::{Result, SplitrunError};
use crate::experiments::{Experiment, ExperimentResults, VariantMetrics};

/// External service that gathers and aggregates experiment metrics.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn start_collection(&self, experiment: &Experiment) -> Result<()>;

    async fn stop_collection(&self, experiment: &Experiment) -> Result<()>;

    /// Aggregate KPIs for both variants. May be slow.
    async fn compute_kpis(&self, experiment: &Experiment) -> Result<ExperimentResults>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Collector
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct KpiResponse {
    baseline: VariantMetrics,
    candidate: VariantMetrics,
    #[serde(default)]
    computed_at: Option<DateTime<Utc>>,
}

/// Collector reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetricsCollector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetricsCollector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SplitrunError::configuration(format!("Invalid collector client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, experiment: &Experiment, path: &str) -> String {
        format!("{}/experiments/{}/{}", self.base_url, experiment.id, path)
    }

    async fn post(&self, url: String, experiment: &Experiment) -> Result<()> {
        self.client
            .post(&url)
            .json(&serde_json::json!({
                "experiment_id": experiment.id,
                "baseline_pipeline": experiment.config.baseline_pipeline,
                "candidate_pipeline": experiment.config.candidate_pipeline,
                "target_hosts": experiment.config.target_hosts,
            }))
            .send()
            .await?
            .error_for_status()?;
        debug!(url = %url, "Collector request succeeded");
        Ok(())
    }
}

#[async_trait]
impl MetricsCollector for HttpMetricsCollector {
    #[instrument(skip_all, fields(experiment_id = %experiment.id))]
    async fn start_collection(&self, experiment: &Experiment) -> Result<()> {
        self.post(self.url(experiment, "collection/start"), experiment)
            .await
    }

    #[instrument(skip_all, fields(experiment_id = %experiment.id))]
    async fn stop_collection(&self, experiment: &Experiment) -> Result<()> {
        self.post(self.url(experiment, "collection/stop"), experiment)
            .await
    }

    #[instrument(skip_all, fields(experiment_id = %experiment.id))]
    async fn compute_kpis(&self, experiment: &Experiment) -> Result<ExperimentResults> {
        let response: KpiResponse = self
            .client
            .get(self.url(experiment, "kpis"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(ExperimentResults {
            baseline: response.baseline,
            candidate: response.candidate,
            computed_at: response.computed_at.unwrap_or_else(Utc::now),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// No-op Collector
// ═══════════════════════════════════════════════════════════════════════════════

/// Stand-in when no collector is configured. Start and stop succeed;
/// KPI computation fails, so analysis ends in `failed`.
#[derive(Debug, Clone, Default)]
pub struct NoopCollector;

#[async_trait]
impl MetricsCollector for NoopCollector {
    async fn start_collection(&self, _experiment: &Experiment) -> Result<()> {
        Ok(())
    }

    async fn stop_collection(&self, _experiment: &Experiment) -> Result<()> {
        Ok(())
    }

    async fn compute_kpis(&self, _experiment: &Experiment) -> Result<ExperimentResults> {
        Err(SplitrunError::collector("No metrics collector configured"))
    }
}

/// Build the collector described by configuration.
pub fn from_config(config: &CollectorConfig) -> Result<std::sync::Arc<dyn MetricsCollector>> {
    Ok(match config.base_url.as_deref() {
        Some(url) => std::sync::Arc::new(HttpMetricsCollector::new(url, config.timeout)?),
        None => std::sync::Arc::new(NoopCollector),
    })
}
