//! Detection events as stored and as served.
//!
//! A `NewDetection` is what the relay hands to the store; the store answers
//! with a `DetectionEvent` carrying its assigned id and capture time. The wire
//! shape (`DetectionRecord`) is derived on read, which is where confidence is
//! clamped and snapshot references become absolute URLs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Wet/dry label reported by the inference service.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Moisture {
    Wet,
    Dry,
}

impl Moisture {
    pub fn as_str(self) -> &'static str {
        match self {
            Moisture::Wet => "wet",
            Moisture::Dry => "dry",
        }
    }

    /// Case-insensitive parse; any other label is undetermined.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "wet" => Some(Moisture::Wet),
            "dry" => Some(Moisture::Dry),
            _ => None,
        }
    }
}

/// An event that has not been assigned an id yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewDetection {
    pub waste_class: Option<String>,
    pub moisture: Option<Moisture>,
    pub confidence: f64,
    pub is_violation: bool,
    pub snapshot_ref: Option<String>,
    /// Upstream capture time; the store substitutes "now" when absent.
    pub captured_at: Option<DateTime<Utc>>,
}

impl NewDetection {
    pub fn has_detection(&self) -> bool {
        self.waste_class.is_some()
    }

    /// Materializes the event without persisting it.
    pub fn unpersisted(self) -> DetectionEvent {
        let captured_at = self.captured_at.unwrap_or_else(now_millis);
        DetectionEvent {
            id: None,
            waste_class: self.waste_class,
            moisture: self.moisture,
            confidence: self.confidence,
            is_violation: self.is_violation,
            snapshot_ref: self.snapshot_ref,
            captured_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    /// `None` only for events the relay returned without persisting.
    pub id: Option<i64>,
    pub waste_class: Option<String>,
    pub moisture: Option<Moisture>,
    /// Raw value as provided upstream. Use `clamped_confidence` for display.
    pub confidence: f64,
    pub is_violation: bool,
    pub snapshot_ref: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn clamped_confidence(&self) -> f64 {
        clamp_confidence(self.confidence)
    }

    pub fn to_record(&self, resolver: &SnapshotUrlResolver) -> DetectionRecord {
        DetectionRecord {
            id: self.id,
            class: self.waste_class.clone(),
            wet_dry: self.moisture,
            confidence: self.clamped_confidence(),
            is_violation: self.is_violation,
            snapshot_url: self
                .snapshot_ref
                .as_deref()
                .and_then(|reference| resolver.resolve(reference)),
            timestamp: self.captured_at,
        }
    }
}

/// JSON shape served by `/live` and `/logs`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub class: Option<String>,
    pub wet_dry: Option<Moisture>,
    pub confidence: f64,
    pub is_violation: bool,
    pub snapshot_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Current time truncated to the millisecond precision the store keeps.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Turns stored snapshot references into URLs a browser can fetch.
#[derive(Clone, Debug)]
pub struct SnapshotUrlResolver {
    base: Url,
}

impl SnapshotUrlResolver {
    pub fn new(public_base_url: &Url) -> Self {
        let mut base = public_base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { base }
    }

    /// Absolute http(s) references pass through; relative ones are joined
    /// onto the public base URL.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        if is_absolute_http(reference) {
            return Some(reference.to_string());
        }
        self.base
            .join(reference.trim_start_matches('/'))
            .ok()
            .map(|url| url.to_string())
    }
}

pub(crate) fn is_absolute_http(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
