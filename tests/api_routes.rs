use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::tempdir;
use url::Url;

use waste_monitor::api::{ApiConfig, ApiHandle, ApiServer};
use waste_monitor::{
    BillingConfig, DetectionRelay, LogQueryService, MonitorServices, NewDetection, SharedStore,
    SnapshotDirectory, SnapshotUrlResolver, SqliteDetectionStore,
};

const ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Fake inference service answering `/live` with whatever payload is queued.
struct StubUpstream {
    addr: SocketAddr,
    reply: Arc<Mutex<(u16, String)>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StubUpstream {
    fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let reply = Arc::new(Mutex::new((200, json!({"class": null}).to_string())));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_reply = reply.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let mut buf = [0u8; 2048];
                        let _ = stream.read(&mut buf);
                        let (status, body) = thread_reply.lock().unwrap().clone();
                        let reason = if status == 200 { "OK" } else { "Error" };
                        let response = format!(
                            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = stream.write_all(response.as_bytes());
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        });

        Ok(Self {
            addr,
            reply,
            shutdown,
            join: Some(join),
        })
    }

    fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    fn respond(&self, status: u16, body: Value) {
        *self.reply.lock().unwrap() = (status, body.to_string());
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct TestApi {
    dir: tempfile::TempDir,
    store: SharedStore,
    upstream: StubUpstream,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_upstream(StubUpstream::start()?, None)
    }

    fn with_upstream(upstream: StubUpstream, upstream_url: Option<Url>) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("waste.db");
        let store = SharedStore::new(SqliteDetectionStore::open(&db_path.to_string_lossy())?);
        let resolver = SnapshotUrlResolver::new(&Url::parse("http://localhost:4000")?);
        let upstream_url = upstream_url.unwrap_or_else(|| upstream.url());

        let services = MonitorServices {
            relay: Arc::new(DetectionRelay::new(
                &upstream_url,
                Duration::from_secs(2),
                store.clone(),
            )),
            logs: LogQueryService::new(store.clone(), resolver.clone()),
            billing: waste_monitor::BillingAggregator::new(
                store.clone(),
                BillingConfig {
                    base_fee: 1350.0,
                    penalty_per_violation: 50.0,
                    currency: "INR".to_string(),
                },
            ),
            snapshots: SnapshotDirectory::open(dir.path().join("snapshots"))?,
            resolver,
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            allowed_origins: vec![ALLOWED_ORIGIN.to_string()],
        };
        let api_handle = ApiServer::new(api_config, services).spawn()?;

        Ok(Self {
            dir,
            store,
            upstream,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn request(&self, raw: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.write_all(raw.as_bytes())?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response header terminator");
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((headers, response[split + 4..].to_vec()))
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.request(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
    }

    fn get_json(&self, path: &str) -> Result<(String, Value)> {
        let (headers, body) = self.get(path)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_reports_running() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.get_json("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "running");
    assert_eq!(body["service"], "Waste Detection Backend");
    Ok(())
}

#[test]
fn live_relays_and_logs_detection() -> Result<()> {
    let api = TestApi::new()?;
    api.upstream.respond(
        200,
        json!({
            "class": "plastic",
            "wet_dry": "dry",
            "confidence": 0.87,
            "is_violation": true,
            "snapshot_path": "C:\\ml\\snapshots\\violation_1.jpg"
        }),
    );

    let (headers, body) = api.get_json("/live")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["id"], 1);
    assert_eq!(body["class"], "plastic");
    assert_eq!(body["wet_dry"], "dry");
    assert_eq!(body["confidence"], 0.87);
    assert_eq!(body["is_violation"], true);
    assert_eq!(
        body["snapshot_url"],
        "http://localhost:4000/snapshots/violation_1.jpg"
    );
    assert!(body["timestamp"].is_string());
    assert_eq!(api.store.count_total()?, 1);
    Ok(())
}

#[test]
fn live_without_class_is_not_logged() -> Result<()> {
    let api = TestApi::new()?;
    api.upstream.respond(
        200,
        json!({"class": null, "wet_dry": null, "confidence": 0.0, "is_violation": false, "snapshot_path": null}),
    );

    let (headers, body) = api.get_json("/live")?;
    assert!(headers.contains("200 OK"));
    assert!(body.get("id").is_none());
    assert_eq!(body["class"], Value::Null);
    assert_eq!(body["snapshot_url"], Value::Null);
    assert!(api.store.list_recent(None)?.is_empty());
    Ok(())
}

#[test]
fn live_upstream_failure_is_bad_gateway() -> Result<()> {
    let api = TestApi::new()?;
    api.upstream.respond(500, json!({"error": "camera offline"}));

    let (headers, body) = api.get_json("/live")?;
    assert!(headers.contains("502 Bad Gateway"));
    assert_eq!(body["error"], "upstream_unavailable");
    assert!(api.store.list_recent(None)?.is_empty());
    Ok(())
}

#[test]
fn live_unreachable_upstream_writes_nothing() -> Result<()> {
    let closed = TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let api = TestApi::with_upstream(
        StubUpstream::start()?,
        Some(Url::parse(&format!("http://{closed}"))?),
    )?;

    let (headers, _) = api.get("/live")?;
    assert!(headers.contains("502 Bad Gateway"));
    assert_eq!(api.store.count_total()?, 0);
    Ok(())
}

#[test]
fn logs_are_newest_first_and_limited() -> Result<()> {
    let api = TestApi::new()?;
    for class in ["paper", "plastic", "metal"] {
        api.store.append(NewDetection {
            waste_class: Some(class.to_string()),
            snapshot_ref: Some(format!("snapshots/{class}.jpg")),
            ..NewDetection::default()
        })?;
    }

    let (_, body) = api.get_json("/logs")?;
    let classes: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["class"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(classes, vec!["metal", "plastic", "paper"]);
    assert_eq!(
        body[0]["snapshot_url"],
        "http://localhost:4000/snapshots/metal.jpg"
    );
    assert_eq!(body[0]["id"], 3);

    let (_, body) = api.get_json("/logs?limit=2")?;
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[1]["class"], "plastic");

    let (_, body) = api.get_json("/logs?limit=lots")?;
    assert_eq!(body.as_array().unwrap().len(), 3);
    Ok(())
}

#[test]
fn billing_counts_violations() -> Result<()> {
    let api = TestApi::new()?;
    for (class, violation) in [(Some("plastic"), true), (Some("paper"), false), (None, false)] {
        api.store.append(NewDetection {
            waste_class: class.map(str::to_string),
            is_violation: violation,
            ..NewDetection::default()
        })?;
    }

    let (headers, body) = api.get_json("/billing")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["base_fee"], 1350.0);
    assert_eq!(body["violation_count"], 1);
    assert_eq!(body["penalty_per_violation"], 50.0);
    assert_eq!(body["penalty_total"], 50.0);
    assert_eq!(body["total_bill"], 1400.0);
    assert_eq!(body["total_items"], 2);
    assert_eq!(body["currency"], "INR");
    Ok(())
}

#[test]
fn snapshots_are_served_from_directory() -> Result<()> {
    let api = TestApi::new()?;
    std::fs::write(
        api.dir.path().join("snapshots").join("violation_9.jpg"),
        b"\xff\xd8\xff\xe0fake",
    )?;

    let (headers, body) = api.get("/snapshots/violation_9.jpg")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(body, b"\xff\xd8\xff\xe0fake");

    let (headers, _) = api.get("/snapshots/../waste.db")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn encoded_snapshot_names_are_decoded_then_guarded() -> Result<()> {
    let api = TestApi::new()?;
    std::fs::write(
        api.dir.path().join("snapshots").join("violation 1.jpg"),
        b"\xff\xd8\xff\xe0spaced",
    )?;
    std::fs::write(api.dir.path().join("secret.png"), b"outside")?;

    let (headers, body) = api.get("/snapshots/violation%201.jpg")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(body, b"\xff\xd8\xff\xe0spaced");

    for path in [
        "/snapshots/..%2Fsecret.png",
        "/snapshots/%2E%2E%2Fsecret.png",
        "/snapshots/..%5Csecret.png",
        "/snapshots/violation%00.jpg",
    ] {
        let (headers, _) = api.get(path)?;
        assert!(headers.contains("404 Not Found"), "{path}: {headers}");
    }
    Ok(())
}

#[test]
fn unknown_paths_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.get_json("/events")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "not_found");

    let (headers, _) = api.request("POST /live HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("405 Method Not Allowed"));
    assert_eq!(api.store.count_total()?, 0);
    Ok(())
}

#[test]
fn cors_headers_only_for_allowed_origins() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.request(&format!(
        "GET /health HTTP/1.1\r\nHost: localhost\r\nOrigin: {ALLOWED_ORIGIN}\r\n\r\n"
    ))?;
    assert!(headers.contains(&format!("Access-Control-Allow-Origin: {ALLOWED_ORIGIN}")));

    let (headers, _) = api.request(
        "GET /health HTTP/1.1\r\nHost: localhost\r\nOrigin: http://evil.example\r\n\r\n",
    )?;
    assert!(!headers.contains("Access-Control-Allow-Origin"));

    let (headers, body) = api.request(&format!(
        "OPTIONS /billing HTTP/1.1\r\nHost: localhost\r\nOrigin: {ALLOWED_ORIGIN}\r\n\r\n"
    ))?;
    assert!(headers.contains("204 No Content"));
    assert!(headers.contains("Access-Control-Allow-Methods: GET, OPTIONS"));
    assert!(body.is_empty());
    Ok(())
}
