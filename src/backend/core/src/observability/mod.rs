//! Observability: Logging, Distributed Tracing, and Metrics.
//!
//! - `tracing-subscriber` with an `EnvFilter` and a json/pretty/compact fmt layer
//! - optional OTLP span export through `tracing-opentelemetry`
//! - Prometheus recorder for the `metrics` facade, rendered at `GET /metrics`

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// Initialize the logging and tracing stack.
pub fn init(config: &ObservabilityConfig, service_name: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Set up OpenTelemetry tracing if endpoint is provided
    let tracer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(
            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?,
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t)));

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).try_init()?,
    }

    Ok(())
}

/// Shutdown OpenTelemetry, flushing pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metric names and recorder setup.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, gauge};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    pub const TASKS_ENQUEUED: &str = "splitrun_tasks_enqueued_total";
    pub const TASK_RETRIES: &str = "splitrun_task_retries_total";
    pub const TASKS_REAPED: &str = "splitrun_tasks_reaped_total";
    pub const TASKS_CLEANED: &str = "splitrun_tasks_cleaned_total";
    pub const PHASE_TRANSITIONS: &str = "splitrun_phase_transitions_total";
    pub const HUB_MESSAGES_DROPPED: &str = "splitrun_hub_messages_dropped_total";
    pub const HUB_CLIENTS: &str = "splitrun_hub_clients";
    pub const ERRORS: &str = "splitrun_errors_total";

    /// Install the Prometheus recorder and register metric descriptions.
    pub fn install() -> anyhow::Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        register_metrics();
        Ok(handle)
    }

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(TASKS_ENQUEUED, "Total number of tasks enqueued, retries included");
        describe_counter!(TASK_RETRIES, "Total number of retry tasks synthesized from failures");
        describe_counter!(TASKS_REAPED, "Total number of stale tasks forced to failed");
        describe_counter!(TASKS_CLEANED, "Total number of aged terminal tasks deleted");
        describe_counter!(PHASE_TRANSITIONS, "Experiment phase transitions by edge");
        describe_counter!(
            HUB_MESSAGES_DROPPED,
            "Messages dropped because a client's outbound buffer was full"
        );
        describe_counter!(ERRORS, "Errors by code and category");

        // Gauges
        describe_gauge!(HUB_CLIENTS, "Number of registered hub clients");
    }

    /// Record a successful phase transition.
    pub fn record_transition(from: &str, to: &str) {
        counter!(PHASE_TRANSITIONS, "from" => from.to_string(), "to" => to.to_string())
            .increment(1);
    }

    /// Update registered client count.
    pub fn set_hub_clients(count: usize) {
        gauge!(HUB_CLIENTS).set(count as f64);
    }
}
