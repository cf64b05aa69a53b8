//! qfleetd - QFleet learning daemon
//!
//! Serves action selection and transition learning for agent fleets and
//! keeps the shared Q-table in PostgreSQL.

#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use qfleet_core::util::load_env_file;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qfleet_daemon::{Config, QFleetDaemon};

#[derive(Debug, Parser)]
#[command(name = "qfleetd", version, about = "QFleet learning daemon")]
struct Args {
    /// Configuration file (defaults to ./qfleet.toml, then ~/.config/qfleet/qfleet.toml)
    #[arg(short, long, env = "QFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from qfleet.env file first
    load_env_file();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(Some(path.as_path()))?,
        None => Config::load()?,
    };

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    let file_logging_enabled = init_tracing(&config);

    info!("Starting QFleet daemon v{}", env!("CARGO_PKG_VERSION"));
    if file_logging_enabled {
        info!("Logging to file: {}", config.daemon.log_file);
    } else if !config.daemon.log_file.is_empty() {
        warn!("File logging was configured but could not be enabled");
    }
    info!(
        "Configuration loaded: bind_address={}, postgres={}, agent overrides={}",
        config.daemon.bind_address,
        if config.postgres.enabled { "enabled" } else { "disabled" },
        config.learning.agents.len()
    );

    let daemon = Arc::new(QFleetDaemon::new(config).await?);
    let daemon_handle = daemon.clone();

    let daemon_task = tokio::spawn(async move {
        if let Err(e) = daemon.run().await {
            error!("Daemon error: {:#}", e);
        }
    });

    // Wait for shutdown signal (SIGINT or SIGTERM)
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    daemon_handle.shutdown().await?;
    let _ = daemon_task.await;

    info!("QFleet daemon stopped");
    Ok(())
}

/// Stdout logging, plus a file layer when `daemon.log_file` is writable
fn init_tracing(config: &Config) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "qfleetd={level},qfleet_daemon={level},qfleet_rl={level},tower_http=debug",
            level = config.daemon.log_level
        )
        .into()
    });

    if config.daemon.log_file.is_empty() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return false;
    }

    let log_path = std::path::Path::new(&config.daemon.log_file);
    let log_dir = log_path.parent().unwrap_or(std::path::Path::new("."));
    let log_filename = log_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("qfleetd.log");

    let can_write = (|| -> std::io::Result<()> {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }
        let test_path = log_dir.join(".write_test");
        std::fs::write(&test_path, "test")?;
        std::fs::remove_file(&test_path)?;
        Ok(())
    })();

    match can_write {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .init();

            // Guard must outlive every log call
            Box::leak(Box::new(guard));
            true
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            eprintln!(
                "Warning: Could not set up file logging to '{}': {}. Using stdout only.",
                config.daemon.log_file, e
            );
            false
        }
    }
}

/// Wait for shutdown signal (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}. Using fallback.", e);
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
                error!("Failed to install SIGTERM handler: {}. Using Ctrl+C only.", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
