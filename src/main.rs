//! Terragraph E2E controller daemon.
//!
//! Brings up the broker, all controller apps, and the upgrade image
//! endpoint, then runs until SIGINT/SIGTERM.

use anyhow::Result;
use terragraph_e2e::{config, ctrl};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn run() -> Result<()> {
    // Initialize logging (RUST_LOG > LOG_LEVEL > default)
    let log_filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "terragraph_e2e=debug".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Terragraph E2E controller v{} ({})",
        env!("TG_VERSION"),
        env!("TG_GIT_SHA")
    );

    let config_file = std::env::var("TG_CONTROLLER_CONFIG").ok();
    let settings = config::load_controller_settings(config_file.as_deref())?;
    tracing::info!(
        "Configuration loaded: minions :{}, apps :{}, events :{}",
        settings.minion_router_port,
        settings.app_router_port,
        settings.event_pub_port
    );
    if settings.bstar.enabled() {
        tracing::info!(
            "High availability enabled: {} peer {}:{}",
            if settings.bstar.primary { "primary" } else { "backup" },
            settings.bstar.peer_host,
            settings.bstar.peer_pub_port
        );
    }

    let shared = ctrl::load_shared_state(&settings)?;
    let handle =
        ctrl::spawn_controller(&settings, shared, env!("TG_VERSION").to_string()).await?;

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
        println!("e2e-controller {} ({})", env!("TG_VERSION"), env!("TG_GIT_SHA"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("e2e-controller {} ({})", env!("TG_VERSION"), env!("TG_GIT_SHA"));
        println!();
        println!("Terragraph E2E controller: coordinates a wireless mesh network.");
        println!();
        println!("USAGE:");
        println!("    e2e-controller [OPTIONS]");
        println!();
        println!("OPTIONS:");
        println!("    -h, --help       Print help information");
        println!("    -V, --version    Print version information");
        println!();
        println!("ENVIRONMENT VARIABLES:");
        println!("    TG_CONTROLLER_CONFIG    Settings file path");
        println!("    TG_CONTROLLER_*         Individual setting overrides");
        println!("    RUST_LOG                Log filter (default: terragraph_e2e=debug)");
        return Ok(());
    }

    run().await
}
