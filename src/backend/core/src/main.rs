//! Splitrun Server - Main entry point
//!
//! Control plane for fleet-wide observability pipeline A/B experiments.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use splitrun_core::{
    api::{self, AppState},
    collector,
    config::Config,
    experiments::ExperimentStateMachine,
    hub::NotificationHub,
    observability,
    store::{InMemoryStore, PgStore, Store},
    tasks::TaskQueue,
};

#[derive(Parser)]
#[command(name = "splitrun-server", version, about = "Splitrun experiment control plane")]
struct Cli {
    /// Configuration file path; environment variables override it
    #[arg(short, long, env = "SPLITRUN_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    let config = Arc::new(config);

    // Initialize observability
    observability::init(&config.observability, "splitrun-server")?;
    let prometheus = if config.observability.metrics_enabled {
        Some(observability::metrics::install()?)
    } else {
        None
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Splitrun Server");

    // Store
    let store: Arc<dyn Store> = match &config.database.url {
        Some(_) => {
            let store = PgStore::connect(&config.database).await?;
            tracing::info!("Connected to database");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No database configured, using in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    // Hub, queue and lifecycle
    let hub = NotificationHub::start(config.hub.clone());
    let queue = Arc::new(TaskQueue::new(
        store.clone(),
        hub.clone(),
        config.task_queue.clone(),
    ));
    let maintenance = queue.start_maintenance();

    let collector = collector::from_config(&config.collector)?;
    let state_machine = ExperimentStateMachine::new(
        store.clone(),
        queue.clone(),
        hub.clone(),
        collector,
        config.lifecycle.clone(),
    );

    let shutdown = CancellationToken::new();
    let app_state = AppState {
        state_machine: state_machine.clone(),
        queue,
        hub: hub.clone(),
        store,
        config: config.clone(),
        prometheus,
        shutdown: shutdown.clone(),
    };

    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // Cleanup
    maintenance.stop().await;
    state_machine.shutdown();
    hub.shutdown();
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM, then release parked long-polls.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
