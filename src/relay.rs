//! Live detection relay.
//!
//! Pulls the current detection from the inference service, coerces the
//! payload into a `NewDetection`, and logs it when a waste class was
//! detected. Empty polls are returned to the caller but never stored.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::MonitorError;
use crate::event::{is_absolute_http, DetectionEvent, Moisture, NewDetection};
use crate::storage::SharedStore;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_PREFIX: &str = "snapshots/";

pub struct DetectionRelay {
    agent: ureq::Agent,
    live_url: String,
    store: SharedStore,
}

impl DetectionRelay {
    pub fn new(upstream: &Url, timeout: Duration, store: SharedStore) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            live_url: live_endpoint(upstream),
            store,
        }
    }

    pub fn live_url(&self) -> &str {
        &self.live_url
    }

    /// One upstream poll. Nothing is written when the upstream call fails.
    pub fn fetch_live(&self) -> Result<DetectionEvent, MonitorError> {
        let payload = self.fetch_payload()?;
        let detection = parse_upstream_payload(&payload);
        if !detection.has_detection() {
            log::debug!("live poll carried no detection; not logged");
            return Ok(detection.unpersisted());
        }
        Ok(self.store.append(detection)?)
    }

    fn fetch_payload(&self) -> Result<Value, MonitorError> {
        let response = self.agent.get(&self.live_url).call().map_err(|err| {
            let reason = match err {
                ureq::Error::Status(code, _) => format!("{} returned HTTP {}", self.live_url, code),
                ureq::Error::Transport(transport) => format!("{}: {}", self.live_url, transport),
            };
            MonitorError::UpstreamUnavailable(reason)
        })?;
        let body = response.into_string().map_err(|e| {
            MonitorError::UpstreamUnavailable(format!("read {}: {}", self.live_url, e))
        })?;
        serde_json::from_str(&body).map_err(|e| {
            MonitorError::UpstreamUnavailable(format!("invalid json from {}: {}", self.live_url, e))
        })
    }
}

fn live_endpoint(upstream: &Url) -> String {
    let mut base = upstream.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    match base.join("live") {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}live", base),
    }
}

/// Maps an upstream `/live` payload onto a detection. Unknown or malformed
/// fields degrade to null, `0.0` or `false`.
pub fn parse_upstream_payload(payload: &Value) -> NewDetection {
    let snapshot = text_field(payload, "snapshot_path").or_else(|| text_field(payload, "snapshot_url"));
    NewDetection {
        waste_class: text_field(payload, "class"),
        moisture: text_field(payload, "wet_dry").and_then(|label| Moisture::parse(&label)),
        confidence: payload
            .get("confidence")
            .and_then(coerce_f64)
            .unwrap_or(0.0),
        is_violation: payload
            .get("is_violation")
            .and_then(coerce_bool)
            .unwrap_or(false),
        snapshot_ref: snapshot.as_deref().and_then(snapshot_reference),
        captured_at: payload.get("timestamp").and_then(coerce_timestamp),
    }
}

/// Rewrites an upstream snapshot location into a reference this service can
/// serve. File-system paths (either separator) keep only their file name.
pub fn snapshot_reference(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if is_absolute_http(raw) {
        return Some(raw.to_string());
    }
    let filename = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if filename.is_empty() || filename == "." || filename == ".." {
        return None;
    }
    Some(format!("{SNAPSHOT_PREFIX}{filename}"))
}

fn text_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
        }
        _ => None,
    }
}
