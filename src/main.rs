//! PostgreSQL backup tool
//!
//! Dumps a database with pg_dump, uploads the gzipped archive to S3 and keeps
//! only the newest archive per retention class (daily, weekly).

// pg-s3-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod scheduler;
mod utils;

use anyhow::{Context, Result};
use backup::RetentionClass;
use clap::Parser;
use config::AppConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file (defaults to ./config.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one backup and exit instead of scheduling
    #[arg(long)]
    single_shot: bool,

    /// Run one backup immediately, then keep scheduling
    #[arg(long)]
    run_on_startup: bool,

    /// Retention class for the startup / single-shot run
    #[arg(long, value_enum)]
    class: Option<RetentionClass>,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_s3_backup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run_app(Args::parse()).await {
        Ok(_) => {
            tracing::info!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(args: Args) -> Result<()> {
    tracing::info!("🚀 Starting pg-s3-backup v{}", env!("CARGO_PKG_VERSION"));

    let mut app_config = AppConfig::load(args.config.as_deref())
        .context("Failed to load application configuration")?;
    app_config.schedule.single_shot |= args.single_shot;
    app_config.schedule.run_on_startup |= args.run_on_startup;
    if let Some(class) = args.class {
        app_config.schedule.startup_class = class;
    }

    let orchestrator = backup::build_orchestrator(&app_config)
        .await
        .context("Failed to set up the backup pipeline")?;

    scheduler::run(Arc::new(orchestrator), &app_config.schedule, shutdown_signal())
        .await
        .context("Backup run failed")?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
