//! Waste Monitor
//!
//! Backend for a waste-sorting camera. An external inference service reports
//! what the camera currently sees; this crate relays those detections, keeps
//! an append-only log of them in SQLite, and bills violations.
//!
//! # Module Structure
//!
//! - `event`: detection events, wire records, snapshot URL resolution
//! - `storage`: the append-only detection store (SQLite and in-memory)
//! - `relay`: pulls live detections from the inference service
//! - `logs`: newest-first log history
//! - `billing`: base fee plus per-violation penalty
//! - `snapshots`: snapshot images served to the frontend
//! - `api`: the HTTP surface
//! - `config`: file + environment configuration

use anyhow::Result;
use std::sync::Arc;

pub mod api;
pub mod billing;
pub mod config;
pub mod error;
pub mod event;
pub mod logs;
pub mod relay;
pub mod snapshots;
pub mod storage;

pub use billing::{BillingAggregator, BillingConfig, BillingSnapshot};
pub use config::MonitorConfig;
pub use error::{MonitorError, StoreError};
pub use event::{DetectionEvent, DetectionRecord, Moisture, NewDetection, SnapshotUrlResolver};
pub use logs::LogQueryService;
pub use relay::DetectionRelay;
pub use snapshots::SnapshotDirectory;
pub use storage::{DetectionStore, InMemoryDetectionStore, SharedStore, SqliteDetectionStore};

/// Everything a request handler needs, wired to one shared store.
#[derive(Clone)]
pub struct MonitorServices {
    pub relay: Arc<DetectionRelay>,
    pub logs: LogQueryService,
    pub billing: BillingAggregator,
    pub snapshots: SnapshotDirectory,
    pub resolver: SnapshotUrlResolver,
}

impl MonitorServices {
    pub fn from_config(cfg: &MonitorConfig, store: SharedStore) -> Result<Self> {
        let resolver = SnapshotUrlResolver::new(&cfg.server.public_base_url);
        let relay = DetectionRelay::new(&cfg.upstream.url, cfg.upstream.timeout, store.clone());
        Ok(Self {
            relay: Arc::new(relay),
            logs: LogQueryService::new(store.clone(), resolver.clone()),
            billing: BillingAggregator::new(store, cfg.billing.clone()),
            snapshots: SnapshotDirectory::open(cfg.snapshots_dir.clone())?,
            resolver,
        })
    }
}
