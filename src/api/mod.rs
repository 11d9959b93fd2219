//! HTTP surface of the monitor.
//!
//! A listener thread accepts connections and hands each one to its own
//! worker thread. Every request is independent; the only shared state lives
//! behind the services' store handle.

use anyhow::{anyhow, Result};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::MonitorError;
use crate::MonitorServices;

const MAX_REQUEST_BYTES: usize = 8192;
const SERVICE_NAME: &str = "Waste Detection Backend";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Origins that receive CORS headers. Others get plain responses.
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4000".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stops accepting connections. Requests already handed to workers are
    /// not awaited.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    services: MonitorServices,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, services: MonitorServices) -> Self {
        Self { cfg, services }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let services = self.services;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, services, shutdown_thread) {
                log::error!("monitor api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    services: MonitorServices,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let services = services.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &services, &cfg) {
                        log::warn!("monitor api request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    services: &MonitorServices,
    cfg: &ApiConfig,
) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let cors_origin = request
        .headers
        .get("origin")
        .filter(|origin| cfg.allowed_origins.iter().any(|allowed| allowed == *origin))
        .cloned();

    let response = route(&request, services);
    write_response(&mut stream, &response, cors_origin.as_deref())
}

fn route(request: &HttpRequest, services: &MonitorServices) -> Response {
    if request.method == "OPTIONS" {
        return Response::empty(204);
    }
    if request.method != "GET" {
        return Response::error(405, "method_not_allowed");
    }

    let result = match request.path.as_str() {
        "/health" => Ok(Response::json(
            200,
            &HealthStatus {
                status: "running",
                service: SERVICE_NAME,
            },
        )),
        "/live" => services
            .relay
            .fetch_live()
            .map(|event| Response::json(200, &event.to_record(&services.resolver))),
        "/logs" => {
            let limit = request
                .query_param("limit")
                .and_then(|value| value.parse::<usize>().ok());
            services
                .logs
                .get_logs(limit)
                .map(|logs| Response::json(200, &logs))
        }
        "/billing" => services
            .billing
            .compute_bill()
            .map(|bill| Response::json(200, &bill)),
        path => {
            return match snapshot_name(path) {
                Some(name) => match services.snapshots.load(&name) {
                    Some(image) => Response {
                        status: 200,
                        content_type: image.content_type,
                        body: image.bytes,
                    },
                    None => Response::error(404, "not_found"),
                },
                None => Response::error(404, "not_found"),
            };
        }
    };

    result.unwrap_or_else(|err: MonitorError| {
        log::warn!("{} {} failed: {}", request.method, request.path, err);
        Response::error(err.status(), err.code())
    })
}

/// Decoded file name of a `/snapshots/<name>` request. The directory
/// applies its own single-component guard to the decoded name.
fn snapshot_name(path: &str) -> Option<String> {
    path.strip_prefix("/snapshots/").map(percent_decode)
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Debug)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::error!("failed to encode response: {}", err);
                Self::error(500, "encoding_failed")
            }
        }
    }

    fn error(status: u16, code: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody { error: code })
            .unwrap_or_else(|_| br#"{"error":"internal"}"#.to_vec());
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

/// Reads up to the end of the header block; request bodies are ignored.
fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request head exceeds {} bytes", MAX_REQUEST_BYTES));
        }
    }
    HttpRequest::parse(&String::from_utf8_lossy(&head))
}

fn write_response(
    stream: &mut TcpStream,
    response: &Response,
    cors_origin: Option<&str>,
) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        502 => "HTTP/1.1 502 Bad Gateway",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    if let Some(origin) = cors_origin {
        header.push_str(&format!(
            "Access-Control-Allow-Origin: {origin}\r\nVary: Origin\r\nAccess-Control-Allow-Credentials: true\r\nAccess-Control-Allow-Methods: GET, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type, Authorization\r\n"
        ));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    /// Path without the query string, still percent-encoded.
    path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn parse(head: &str) -> Result<Self> {
        let mut lines = head.lines();
        let start_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| anyhow!("empty request"))?;
        let (method, target) = match start_line.split_whitespace().collect::<Vec<_>>()[..] {
            [method, target, ..] => (method, target),
            _ => return Err(anyhow!("malformed request line '{}'", start_line)),
        };

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (percent_decode(key), percent_decode(value))
            })
            .collect();

        Ok(Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query,
            headers,
        })
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn percent_decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
