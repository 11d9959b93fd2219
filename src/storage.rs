use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::event::{now_millis, DetectionEvent, Moisture, NewDetection};

/// Append-only log of detection events.
///
/// Rows are never updated or deleted. Ids are assigned in insertion order and
/// strictly increase.
pub trait DetectionStore: Send {
    fn append(&mut self, event: NewDetection) -> Result<DetectionEvent, StoreError>;

    /// Newest first (capture time, then id). `None` returns every row.
    fn list_recent(&mut self, limit: Option<usize>) -> Result<Vec<DetectionEvent>, StoreError>;

    fn count_violations(&mut self) -> Result<u64, StoreError>;

    /// Rows with a detected waste class; empty polls are not items.
    fn count_total(&mut self) -> Result<u64, StoreError>;

    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    /// Opens (or creates) the database and ensures the schema exists.
    ///
    /// Accepts a plain path, `:memory:`, or a `file:` URI.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            if db_path != ":memory:" {
                if let Some(parent) = Path::new(db_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }
            Connection::open(db_path)?
        };
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              class TEXT,
              wet_dry TEXT,
              confidence REAL NOT NULL,
              is_violation INTEGER NOT NULL,
              snapshot_url TEXT,
              captured_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_captured ON detections(captured_at);
            "#,
        )?;
        Ok(())
    }

    fn count_where(&self, predicate: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM detections WHERE {predicate}");
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

struct DetectionRow {
    id: i64,
    class: Option<String>,
    wet_dry: Option<String>,
    confidence: f64,
    is_violation: bool,
    snapshot_url: Option<String>,
    captured_at_ms: i64,
}

impl DetectionRow {
    fn into_event(self) -> Result<DetectionEvent, StoreError> {
        let captured_at = DateTime::from_timestamp_millis(self.captured_at_ms).ok_or_else(|| {
            StoreError::Corrupt {
                id: self.id,
                reason: format!("captured_at {} out of range", self.captured_at_ms),
            }
        })?;
        Ok(DetectionEvent {
            id: Some(self.id),
            waste_class: self.class,
            moisture: self.wet_dry.as_deref().and_then(Moisture::parse),
            confidence: self.confidence,
            is_violation: self.is_violation,
            snapshot_ref: self.snapshot_url,
            captured_at,
        })
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn append(&mut self, event: NewDetection) -> Result<DetectionEvent, StoreError> {
        let captured_at = store_precision(event.captured_at.unwrap_or_else(now_millis));

        self.conn.execute(
            r#"
            INSERT INTO detections(class, wet_dry, confidence, is_violation, snapshot_url, captured_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.waste_class,
                event.moisture.map(Moisture::as_str),
                event.confidence,
                event.is_violation,
                event.snapshot_ref,
                captured_at.timestamp_millis()
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        Ok(DetectionEvent {
            id: Some(id),
            waste_class: event.waste_class,
            moisture: event.moisture,
            confidence: event.confidence,
            is_violation: event.is_violation,
            snapshot_ref: event.snapshot_ref,
            captured_at,
        })
    }

    fn list_recent(&mut self, limit: Option<usize>) -> Result<Vec<DetectionEvent>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, class, wet_dry, confidence, is_violation, snapshot_url, captured_at
                FROM detections
                ORDER BY captured_at DESC, id DESC
                LIMIT ?1
                "#,
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(DetectionRow {
                    id: row.get(0)?,
                    class: row.get(1)?,
                    wet_dry: row.get(2)?,
                    confidence: row.get(3)?,
                    is_violation: row.get(4)?,
                    snapshot_url: row.get(5)?,
                    captured_at_ms: row.get(6)?,
                });
            }
            out
        };

        rows.into_iter().map(DetectionRow::into_event).collect()
    }

    fn count_violations(&mut self) -> Result<u64, StoreError> {
        self.count_where("is_violation = 1")
    }

    fn count_total(&mut self) -> Result<u64, StoreError> {
        self.count_where("class IS NOT NULL")
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    events: Vec<DetectionEvent>,
    next_id: i64,
}

impl DetectionStore for InMemoryDetectionStore {
    fn append(&mut self, event: NewDetection) -> Result<DetectionEvent, StoreError> {
        self.next_id += 1;
        let stored = DetectionEvent {
            id: Some(self.next_id),
            waste_class: event.waste_class,
            moisture: event.moisture,
            confidence: event.confidence,
            is_violation: event.is_violation,
            snapshot_ref: event.snapshot_ref,
            captured_at: store_precision(event.captured_at.unwrap_or_else(now_millis)),
        };
        self.events.push(stored.clone());
        Ok(stored)
    }

    fn list_recent(&mut self, limit: Option<usize>) -> Result<Vec<DetectionEvent>, StoreError> {
        let mut out = self.events.clone();
        out.sort_by(|a, b| {
            b.captured_at
                .cmp(&a.captured_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn count_violations(&mut self) -> Result<u64, StoreError> {
        Ok(self.events.iter().filter(|ev| ev.is_violation).count() as u64)
    }

    fn count_total(&mut self) -> Result<u64, StoreError> {
        Ok(self
            .events
            .iter()
            .filter(|ev| ev.waste_class.is_some())
            .count() as u64)
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-wide handle to the one detection store.
///
/// Each call holds the lock for a single store operation only.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Box<dyn DetectionStore>>>,
}

impl SharedStore {
    pub fn new<S: DetectionStore + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    fn with<T>(
        &self,
        op: impl FnOnce(&mut dyn DetectionStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        op(&mut **guard)
    }

    pub fn append(&self, event: NewDetection) -> Result<DetectionEvent, StoreError> {
        self.with(|store| store.append(event))
    }

    pub fn list_recent(&self, limit: Option<usize>) -> Result<Vec<DetectionEvent>, StoreError> {
        self.with(|store| store.list_recent(limit))
    }

    pub fn count_violations(&self) -> Result<u64, StoreError> {
        self.with(|store| store.count_violations())
    }

    pub fn count_total(&self) -> Result<u64, StoreError> {
        self.with(|store| store.count_total())
    }

    /// `(violations, total)` read under one lock, so both counts describe
    /// the same state of the log.
    pub fn billing_counts(&self) -> Result<(u64, u64), StoreError> {
        self.with(|store| Ok((store.count_violations()?, store.count_total()?)))
    }

    /// Closes the store if this is the last handle. Otherwise the store is
    /// released when the remaining handles drop.
    pub fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().map_err(|_| StoreError::Poisoned)?.close(),
            Err(_) => {
                log::warn!("detection store still in use at close; deferring release");
                Ok(())
            }
        }
    }
}

fn store_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn detection(class: Option<&str>, violation: bool) -> NewDetection {
        NewDetection {
            waste_class: class.map(str::to_string),
            moisture: Some(Moisture::Dry),
            confidence: 0.8,
            is_violation: violation,
            snapshot_ref: None,
            captured_at: None,
        }
    }

    fn stores() -> Vec<(&'static str, Box<dyn DetectionStore>)> {
        vec![
            (
                "sqlite",
                Box::new(SqliteDetectionStore::open(":memory:").expect("sqlite store")),
            ),
            ("memory", Box::new(InMemoryDetectionStore::default())),
        ]
    }

    #[test]
    fn ids_increase_and_listing_is_newest_first() -> Result<(), StoreError> {
        for (name, mut store) in stores() {
            let mut ids = Vec::new();
            for i in 0..5 {
                let class = format!("class-{i}");
                ids.push(store.append(detection(Some(&class), false))?.id.unwrap());
            }
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "{name}: {ids:?}");

            let listed = store.list_recent(None)?;
            let listed_ids: Vec<i64> = listed.iter().map(|ev| ev.id.unwrap()).collect();
            let mut expected = ids.clone();
            expected.reverse();
            assert_eq!(listed_ids, expected, "{name}");
            assert!(listed
                .windows(2)
                .all(|w| w[0].captured_at >= w[1].captured_at));
        }
        Ok(())
    }

    #[test]
    fn limit_returns_most_recent_in_reverse_insertion_order() -> Result<(), StoreError> {
        for (name, mut store) in stores() {
            for i in 0..5 {
                let class = format!("item-{i}");
                store.append(detection(Some(&class), false))?;
            }
            let recent = store.list_recent(Some(2))?;
            let classes: Vec<_> = recent
                .iter()
                .map(|ev| ev.waste_class.clone().unwrap())
                .collect();
            assert_eq!(classes, vec!["item-4", "item-3"], "{name}");
            assert!(store.list_recent(Some(0))?.is_empty(), "{name}");
        }
        Ok(())
    }

    #[test]
    fn counts_follow_class_and_violation_independently() -> Result<(), StoreError> {
        for (name, mut store) in stores() {
            store.append(detection(Some("plastic"), true))?;
            store.append(detection(Some("paper"), false))?;
            store.append(detection(None, false))?;
            store.append(detection(None, true))?;
            assert_eq!(store.count_total()?, 2, "{name}");
            assert_eq!(store.count_violations()?, 2, "{name}");
        }
        Ok(())
    }

    #[test]
    fn missing_fields_are_stored_as_null() -> Result<(), StoreError> {
        for (name, mut store) in stores() {
            let stored = store.append(NewDetection::default())?;
            let listed = store.list_recent(None)?;
            assert_eq!(listed, vec![stored.clone()], "{name}");
            assert_eq!(stored.waste_class, None);
            assert_eq!(stored.moisture, None);
            assert_eq!(stored.snapshot_ref, None);
            assert_eq!(stored.confidence, 0.0);
        }
        Ok(())
    }

    #[test]
    fn supplied_capture_time_orders_listing() -> Result<(), StoreError> {
        for (name, mut store) in stores() {
            let base = now_millis();
            let mut older = detection(Some("older"), false);
            older.captured_at = Some(base - Duration::minutes(5));
            let mut newer = detection(Some("newer"), false);
            newer.captured_at = Some(base);
            store.append(newer)?;
            store.append(older)?;

            let classes: Vec<_> = store
                .list_recent(None)?
                .into_iter()
                .map(|ev| ev.waste_class.unwrap())
                .collect();
            assert_eq!(classes, vec!["newer", "older"], "{name}");
        }
        Ok(())
    }

    #[test]
    fn confidence_is_stored_unclamped() -> Result<(), StoreError> {
        let mut store = SqliteDetectionStore::open(":memory:")?;
        let mut event = detection(Some("glass"), false);
        event.confidence = 1.25;
        store.append(event)?;
        let listed = store.list_recent(None)?;
        assert_eq!(listed[0].confidence, 1.25);
        assert_eq!(listed[0].clamped_confidence(), 1.0);
        Ok(())
    }

    #[test]
    fn sqlite_rows_survive_reopen() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("waste.db");
        let path = path.to_string_lossy().to_string();

        let mut store = SqliteDetectionStore::open(&path)?;
        store.append(detection(Some("metal"), true))?;
        Box::new(store).close()?;

        let mut reopened = SqliteDetectionStore::open(&path)?;
        assert_eq!(reopened.count_total()?, 1);
        assert_eq!(reopened.count_violations()?, 1);
        let next = reopened.append(detection(Some("metal"), false))?;
        assert_eq!(next.id, Some(2));
        Ok(())
    }

    #[test]
    fn shared_store_closes_when_last_handle() -> Result<(), StoreError> {
        let shared = SharedStore::new(InMemoryDetectionStore::default());
        let other = shared.clone();
        other.append(detection(Some("paper"), false))?;
        assert_eq!(shared.count_total()?, 1);
        drop(other);
        shared.close()
    }
}
