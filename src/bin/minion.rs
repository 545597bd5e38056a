//! Terragraph E2E minion daemon.
//!
//! Per-node agent: connects to the controller, mediates the radio firmware
//! through the netlink driver's pair socket, applies configs, and runs
//! upgrades.

use std::sync::Arc;

use anyhow::{Context, Result};
use terragraph_e2e::config;
use terragraph_e2e::driver;
use terragraph_e2e::minion::{self, actions::SystemActionRunner, state::NodeInfo};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn run() -> Result<()> {
    let log_filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "terragraph_e2e=debug".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Terragraph E2E minion v{} ({})",
        env!("TG_VERSION"),
        env!("TG_GIT_SHA")
    );

    let config_file = std::env::var("TG_MINION_CONFIG").ok();
    let settings = config::load_minion_settings(config_file.as_deref())?;

    let node_info = NodeInfo::from_file(std::path::Path::new(&settings.node_info_file))
        .context("loading node info")?;
    tracing::info!("Using node ID {}", node_info.node_id);
    match &node_info.hw_board_id {
        Some(id) => tracing::info!("Current Hardware Board ID: {}", id),
        None => tracing::error!("Unknown Hardware Board ID"),
    }

    let driver_pair = driver::connect_unix(&settings.driver_socket_path)
        .await
        .with_context(|| format!("connecting to driver at {}", settings.driver_socket_path))?;

    let flasher = Arc::new(minion::upgrade_app::FileFlasher::new(
        std::path::Path::new(&settings.image_download_dir).join("flashed.bin"),
    ));

    let handle = minion::spawn_minion(
        &settings,
        node_info,
        driver_pair,
        Arc::new(SystemActionRunner),
        flasher,
        env!("TG_VERSION").to_string(),
    )
    .await?;

    shutdown_signal().await;

    tracing::info!("Shutting down apps...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C, SIGQUIT, or SIGTERM)
#[allow(clippy::expect_used)] // Signal handlers must succeed for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("Failed to install SIGQUIT handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        _ = quit => tracing::info!("Received SIGQUIT, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("e2e-minion {} ({})", env!("TG_VERSION"), env!("TG_GIT_SHA"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("e2e-minion {} ({})", env!("TG_VERSION"), env!("TG_GIT_SHA"));
        println!();
        println!("Terragraph E2E minion: per-node control plane agent.");
        println!();
        println!("USAGE:");
        println!("    e2e-minion [OPTIONS]");
        println!();
        println!("OPTIONS:");
        println!("    -h, --help       Print help information");
        println!("    -V, --version    Print version information");
        println!();
        println!("ENVIRONMENT VARIABLES:");
        println!("    TG_MINION_CONFIG    Settings file path");
        println!("    TG_MINION_*         Individual setting overrides");
        println!("    RUST_LOG            Log filter (default: terragraph_e2e=debug)");
        return Ok(());
    }

    run().await
}
