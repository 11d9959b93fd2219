//! waste_monitor - HTTP backend for the waste sorting camera
//!
//! This daemon:
//! 1. Opens the detection log database
//! 2. Serves /live, /logs, /billing, /health and /snapshots
//! 3. Closes the database on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use waste_monitor::{
    api::{ApiConfig, ApiServer},
    MonitorConfig, MonitorServices, SharedStore, SqliteDetectionStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file. Environment variables override its values.
    #[arg(long, env = "WASTE_MONITOR_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = MonitorConfig::load_from(args.config.as_deref())?;

    let store = SharedStore::new(SqliteDetectionStore::open(&config.db_path)?);
    log::info!("detection log opened at {}", config.db_path);

    let services = MonitorServices::from_config(&config, store.clone())?;
    log::info!(
        "relaying live detections from {} (timeout {:?})",
        services.relay.live_url(),
        config.upstream.timeout
    );
    log::info!(
        "billing: base fee {} + {} per violation ({})",
        config.billing.base_fee,
        config.billing.penalty_per_violation,
        config.billing.currency
    );

    let api_config = ApiConfig {
        addr: config.server.addr.clone(),
        allowed_origins: config.server.allowed_origins.clone(),
    };
    let api_handle = ApiServer::new(api_config, services).spawn()?;
    log::info!("monitor api listening on {}", api_handle.addr);
    log::info!(
        "snapshots served from {} as {}snapshots/",
        config.snapshots_dir.display(),
        config.server.public_base_url
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("waste_monitor waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    store.close()?;
    log::info!("detection log closed");

    Ok(())
}
