//! Mining Supervisor - Main Application
//!
//! Serves the HTTP control API and supervises a single XMRig worker.

use anyhow::{Context, Result};
use mining_supervisor::{
    api::{self, AppState},
    config::{self, Config},
    logging::init_logging,
    ConfigValidator, HostLimits, ResourceInspector, SupervisorHandle, APP_NAME, APP_VERSION,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await.context("Invalid configuration")?;

    // Handle special commands
    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    if let Some(path) = &config.write_example_config {
        config::write_example_config(path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Example mining configuration written to {}", path.display());
        return Ok(());
    }

    let _log_guard = init_logging(config.log_level, config.log_format, config.log_file.as_deref())?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);

    let limits = HostLimits::detect();
    info!(
        "Configuration: miner={}, cores={}, grace_period={}, listen={}:{}",
        config.miner_path.display(),
        limits.logical_cores,
        config.grace_period,
        config.interface,
        config.port
    );

    if let Some(target) = config.throttle_target {
        info!(
            target_cpu_percent = target,
            interval = %config.throttle_interval,
            "CPU throttle enabled"
        );
    }

    let supervisor = SupervisorHandle::spawn(config.supervisor_settings()?);
    let state = AppState {
        supervisor: supervisor.clone(),
        validator: Arc::new(ConfigValidator::new(limits, config.validation_defaults())),
        inspector: ResourceInspector::new(config.metrics_sample_window_duration()?),
    };
    let app = api::router(state, config.cors_origin.as_deref())?;

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Control API listening on {}", addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    info!("Stopping worker before exit");
    if let Err(e) = supervisor.shutdown().await {
        error!("Supervisor shutdown failed: {}", e);
    }

    info!("{} stopped", APP_NAME);
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("# {} v{} configuration", APP_NAME, APP_VERSION);
    print!("{}", yaml);
    Ok(())
}
