//! billing_report - print the current bill (and recent logs) from a detection log

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use waste_monitor::billing::{DEFAULT_BASE_FEE, DEFAULT_CURRENCY, DEFAULT_PENALTY_PER_VIOLATION};
use waste_monitor::{
    BillingAggregator, BillingConfig, BillingSnapshot, DetectionRecord, LogQueryService,
    SharedStore, SnapshotUrlResolver, SqliteDetectionStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection log database.
    #[arg(long, env = "WASTE_DB_PATH", default_value = "data/waste.db")]
    db_path: String,
    /// Monthly base fee.
    #[arg(long, env = "BASE_FEE", default_value_t = DEFAULT_BASE_FEE)]
    base_fee: f64,
    /// Penalty charged per violation.
    #[arg(long, env = "PENALTY_PER_VIOLATION", default_value_t = DEFAULT_PENALTY_PER_VIOLATION)]
    penalty_per_violation: f64,
    /// Currency label for the report.
    #[arg(long, default_value = DEFAULT_CURRENCY)]
    currency: String,
    /// Base URL used to make snapshot references absolute.
    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "http://localhost:4000")]
    public_base_url: String,
    /// Include this many of the most recent logs.
    #[arg(long, value_name = "N")]
    logs: Option<usize>,
}

#[derive(Serialize)]
struct Report {
    billing: BillingSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<Vec<DetectionRecord>>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = BillingConfig {
        base_fee: args.base_fee,
        penalty_per_violation: args.penalty_per_violation,
        currency: args.currency,
    };
    config.validate()?;
    let base_url = url::Url::parse(&args.public_base_url)?;

    let store = SharedStore::new(SqliteDetectionStore::open(&args.db_path)?);
    let billing = BillingAggregator::new(store.clone(), config).compute_bill()?;
    let logs = match args.logs {
        Some(limit) => Some(
            LogQueryService::new(store.clone(), SnapshotUrlResolver::new(&base_url))
                .get_logs(Some(limit))?,
        ),
        None => None,
    };
    store.close()?;

    let report = Report { billing, logs };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
