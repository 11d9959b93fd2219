use crate::error::MonitorError;
use crate::event::{DetectionRecord, SnapshotUrlResolver};
use crate::storage::SharedStore;

/// Read-only view over the detection log.
#[derive(Clone)]
pub struct LogQueryService {
    store: SharedStore,
    resolver: SnapshotUrlResolver,
}

impl LogQueryService {
    pub fn new(store: SharedStore, resolver: SnapshotUrlResolver) -> Self {
        Self { store, resolver }
    }

    /// Newest first. Either the whole read succeeds or nothing is returned.
    pub fn get_logs(&self, limit: Option<usize>) -> Result<Vec<DetectionRecord>, MonitorError> {
        let events = self
            .store
            .list_recent(limit)
            .map_err(MonitorError::QueryFailed)?;
        Ok(events
            .iter()
            .map(|event| event.to_record(&self.resolver))
            .collect())
    }
}
