//! SPM - Entry Point
//!
//! Brings up every configured SSH tunnel with its SOCKS listener and keeps
//! the pool registered until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spm::config::{Config, LogConfig};
use spm::proxy::{SocksListenerFactory, SshTransport};
use spm::registry::Registry;
use spm::services::{Supervisor, SupervisorHandle};
use spm::store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so LOG_LEVEL and LOG_FORMAT apply
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting SPM with {} connection(s)", config.connections.len());

    let store = store::connect(&config.registry.url).await?;
    let registry = Registry::new(store, config.registry_options());
    info!("Connected to registry");

    let (handle, shutdown) = SupervisorHandle::new();
    let supervisor = Supervisor::new(
        config.supervisor_config(),
        config.connections.clone(),
        Arc::new(SshTransport),
        Arc::new(SocksListenerFactory),
        registry,
        shutdown,
    );

    let supervisor_task = tokio::spawn(supervisor.run());

    shutdown_signal().await;
    info!("Shutdown signal received");

    handle.shutdown();
    if let Err(e) = supervisor_task.await {
        error!("Supervisor task failed: {}", e);
    }

    info!("SPM stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spm={},russh=warn", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
