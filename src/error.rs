use thiserror::Error;

/// Failures of the detection store itself.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("detection store lock poisoned")]
    Poisoned,

    #[error("corrupt detection row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Request-scoped failures surfaced by the monitor services.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("inference service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("log query failed: {0}")]
    QueryFailed(#[source] StoreError),

    #[error("billing unavailable: {0}")]
    BillingUnavailable(#[source] StoreError),
}

impl MonitorError {
    pub fn status(&self) -> u16 {
        match self {
            MonitorError::UpstreamUnavailable(_) => 502,
            MonitorError::Storage(_)
            | MonitorError::QueryFailed(_)
            | MonitorError::BillingUnavailable(_) => 500,
        }
    }

    /// Stable code written into `{"error": ...}` response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MonitorError::UpstreamUnavailable(_) => "upstream_unavailable",
            MonitorError::Storage(_) => "storage_error",
            MonitorError::QueryFailed(_) => "query_failed",
            MonitorError::BillingUnavailable(_) => "billing_unavailable",
        }
    }
}
