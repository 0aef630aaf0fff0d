//! Configuration management.
//!
//! Every section has defaults, so an empty environment yields a runnable
//! control plane backed by the in-memory store. Values are layered as:
//! - an optional config file (`Config::from_file`)
//! - `SPLITRUN__<SECTION>__<KEY>` environment variables
//!
//! Durations are human-readable strings such as `"30s"` or `"5m"`.

use serde::Deserialize;
use std::time::Duration;

use crate::error::Result;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Task queue timing
    #[serde(default)]
    pub task_queue: TaskQueueConfig,

    /// Experiment lifecycle timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Notification hub settings
    #[serde(default)]
    pub hub: HubConfig,

    /// External metrics collector
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for the agent long-poll endpoint
    #[serde(default = "default_long_poll_timeout", with = "humantime_serde")]
    pub long_poll_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            long_poll_timeout: default_long_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. When absent the in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Log level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Install the Prometheus recorder and serve `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskQueueConfig {
    /// Re-fetch interval inside a long-poll
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maintenance tick
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,

    /// Assigned/running tasks not updated for this long are reaped
    #[serde(default = "default_stale_threshold", with = "humantime_serde")]
    pub stale_threshold: Duration,

    /// Terminal tasks older than this are deleted
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Attempts per task chain, original included. A failed task is retried
    /// only while `retry_count + 1 < max_retries`.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            maintenance_interval: default_maintenance_interval(),
            stale_threshold: default_stale_threshold(),
            retention: default_retention(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Deployment monitor poll interval
    #[serde(default = "default_deployment_poll_interval", with = "humantime_serde")]
    pub deployment_poll_interval: Duration,

    /// Deadline for all start tasks to complete
    #[serde(default = "default_deployment_timeout", with = "humantime_serde")]
    pub deployment_timeout: Duration,

    /// Pause between deployment completion and entering `running`
    #[serde(default = "default_stabilization_delay", with = "humantime_serde")]
    pub stabilization_delay: Duration,

    /// Wait after asking the collector to stop before analysis
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Metric flush grace period before KPI computation
    #[serde(default = "default_metrics_flush_grace", with = "humantime_serde")]
    pub metrics_flush_grace: Duration,

    /// Delay after publishing results before completing
    #[serde(default = "default_results_publish_delay", with = "humantime_serde")]
    pub results_publish_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            deployment_poll_interval: default_deployment_poll_interval(),
            deployment_timeout: default_deployment_timeout(),
            stabilization_delay: default_stabilization_delay(),
            stop_grace: default_stop_grace(),
            metrics_flush_grace: default_metrics_flush_grace(),
            results_publish_delay: default_results_publish_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Heartbeat and idle-eviction tick
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Clients without inbound activity for this long are evicted
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Per-client outbound buffer
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,

    /// Hub-wide broadcast mailbox
    #[serde(default = "default_broadcast_buffer")]
    pub broadcast_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
            client_buffer: default_client_buffer(),
            broadcast_buffer: default_broadcast_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Base URL of the metrics collector service
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_collector_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: default_collector_timeout(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_long_poll_timeout() -> Duration { Duration::from_secs(30) }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_maintenance_interval() -> Duration { Duration::from_secs(30) }
fn default_stale_threshold() -> Duration { Duration::from_secs(5 * 60) }
fn default_retention() -> Duration { Duration::from_secs(24 * 60 * 60) }
fn default_max_retries() -> i32 { 3 }
fn default_deployment_poll_interval() -> Duration { Duration::from_secs(5) }
fn default_deployment_timeout() -> Duration { Duration::from_secs(10 * 60) }
fn default_stabilization_delay() -> Duration { Duration::from_secs(10) }
fn default_stop_grace() -> Duration { Duration::from_secs(5) }
fn default_metrics_flush_grace() -> Duration { Duration::from_secs(30) }
fn default_results_publish_delay() -> Duration { Duration::from_secs(5) }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(30) }
fn default_idle_timeout() -> Duration { Duration::from_secs(5 * 60) }
fn default_client_buffer() -> usize { 256 }
fn default_broadcast_buffer() -> usize { 1024 }
fn default_collector_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("SPLITRUN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SPLITRUN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
