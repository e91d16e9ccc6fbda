//! Cryptachat server - relays end-to-end encrypted messages and public keys.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cryptachat_relay::Hub;
use tracing::{info, warn};

mod auth;
mod config;
mod db;
mod server;
mod store;
mod telemetry;

use config::ServerConfig;
use db::{Database, MigrationRunner};
use server::AppState;
use telemetry::LogFormat;

/// Cryptachat server
#[derive(Parser)]
#[command(name = "cryptachat-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Environment file to load before reading configuration
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Listen port, overrides PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CRYPTACHAT_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing env file is normal outside development.
    let env_loaded = dotenvy::from_path(&cli.env_file).is_ok();

    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    telemetry::init(format).map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("Cryptachat Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if env_loaded {
        info!(path = %cli.env_file.display(), "Loaded environment file");
    }

    let mut config = ServerConfig::from_env().context("Invalid configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.log_config();

    let db = Database::open("cryptachat", config.db_path.as_deref())
        .await
        .context("Failed to open database")?;
    let migrations = MigrationRunner::default();
    let applied = migrations
        .run(&db)
        .await
        .context("Failed to run migrations")?;
    let schema_version = migrations.current_version(&db).await?;
    info!(applied = ?applied, schema_version = ?schema_version, "Database ready");

    let (hub, hub_handle) = Hub::new(config.hub.clone());
    let hub_task = tokio::spawn(hub.run());

    let state = Arc::new(AppState::new(config, db, hub_handle));
    let cleanup_task = state.limits.spawn_cleanup();

    server::start(state, shutdown_signal()).await?;

    cleanup_task.abort();
    hub_task.abort();
    info!("Cryptachat Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await
        }
    }
}
