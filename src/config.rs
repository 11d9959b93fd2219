use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::billing::{BillingConfig, DEFAULT_BASE_FEE, DEFAULT_CURRENCY, DEFAULT_PENALTY_PER_VIOLATION};

const DEFAULT_DB_PATH: &str = "data/waste.db";
const DEFAULT_SNAPSHOTS_DIR: &str = "snapshots";
const DEFAULT_ADDR: &str = "127.0.0.1:4000";
const DEFAULT_UPSTREAM_URL: &str = "http://localhost:5001";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://localhost:8000",
];

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    snapshots_dir: Option<PathBuf>,
    server: Option<ServerConfigFile>,
    upstream: Option<UpstreamConfigFile>,
    billing: Option<BillingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    public_base_url: Option<String>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct UpstreamConfigFile {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BillingConfigFile {
    base_fee: Option<f64>,
    penalty_per_violation: Option<f64>,
    currency: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub snapshots_dir: PathBuf,
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    /// Base for absolute snapshot URLs handed to browsers.
    pub public_base_url: Url,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub timeout: Duration,
}

/// Settings before URL parsing and derived defaults.
#[derive(Debug)]
struct PendingConfig {
    db_path: String,
    snapshots_dir: PathBuf,
    addr: String,
    public_base_url: Option<String>,
    allowed_origins: Vec<String>,
    upstream_url: String,
    upstream_timeout_secs: u64,
    billing: BillingConfig,
}

impl MonitorConfig {
    /// File named by `WASTE_MONITOR_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WASTE_MONITOR_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => MonitorConfigFile::default(),
        };
        let mut pending = PendingConfig::from_file(file_cfg);
        pending.apply_env()?;
        pending.validate()
    }
}

impl PendingConfig {
    fn from_file(file: MonitorConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let upstream = file.upstream.unwrap_or_default();
        let billing = file.billing.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            snapshots_dir: file
                .snapshots_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOTS_DIR)),
            addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            public_base_url: server.public_base_url,
            allowed_origins: server.allowed_origins.unwrap_or_else(|| {
                DEFAULT_ALLOWED_ORIGINS
                    .iter()
                    .map(|origin| origin.to_string())
                    .collect()
            }),
            upstream_url: upstream
                .url
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            upstream_timeout_secs: upstream
                .timeout_secs
                .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            billing: BillingConfig {
                base_fee: billing.base_fee.unwrap_or(DEFAULT_BASE_FEE),
                penalty_per_violation: billing
                    .penalty_per_violation
                    .unwrap_or(DEFAULT_PENALTY_PER_VIOLATION),
                currency: billing
                    .currency
                    .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_value("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("PORT must be a TCP port number"))?;
            self.addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = env_value("WASTE_MONITOR_ADDR") {
            self.addr = addr;
        }
        if let Some(url) = env_value("PUBLIC_BASE_URL") {
            self.public_base_url = Some(url);
        }
        if let Some(origins) = env_value("ALLOWED_ORIGINS") {
            self.allowed_origins = split_csv(&origins);
        }
        if let Some(path) = env_value("WASTE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_value("SNAPSHOTS_DIR") {
            self.snapshots_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_value("ML_URL") {
            self.upstream_url = url;
        }
        if let Some(timeout) = env_value("UPSTREAM_TIMEOUT_SECS") {
            self.upstream_timeout_secs = timeout.parse().map_err(|_| {
                anyhow!("UPSTREAM_TIMEOUT_SECS must be an integer number of seconds")
            })?;
        }
        if let Some(fee) = env_value("BASE_FEE") {
            self.billing.base_fee = parse_amount("BASE_FEE", &fee)?;
        }
        let penalty = env_value("PENALTY_PER_VIOLATION")
            .map(|value| ("PENALTY_PER_VIOLATION", value))
            .or_else(|| env_value("PENALTY_PER_INCORRECT").map(|value| ("PENALTY_PER_INCORRECT", value)));
        if let Some((name, value)) = penalty {
            self.billing.penalty_per_violation = parse_amount(name, &value)?;
        }
        if let Some(currency) = env_value("BILLING_CURRENCY") {
            self.billing.currency = currency;
        }
        Ok(())
    }

    fn validate(self) -> Result<MonitorConfig> {
        let socket: SocketAddr = self
            .addr
            .parse()
            .map_err(|_| anyhow!("listen address '{}' is not host:port", self.addr))?;
        let public_base_url = match self.public_base_url.as_deref() {
            Some(raw) => parse_http_url("public base url", raw)?,
            None => parse_http_url(
                "public base url",
                &format!("http://localhost:{}", socket.port()),
            )?,
        };
        let upstream_url = parse_http_url("upstream url", &self.upstream_url)?;
        if self.upstream_timeout_secs == 0 {
            return Err(anyhow!("upstream timeout must be greater than zero"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.billing.validate()?;

        Ok(MonitorConfig {
            db_path: self.db_path,
            snapshots_dir: self.snapshots_dir,
            server: ServerSettings {
                addr: self.addr,
                public_base_url,
                allowed_origins: self.allowed_origins,
            },
            upstream: UpstreamSettings {
                url: upstream_url,
                timeout: Duration::from_secs(self.upstream_timeout_secs),
            },
            billing: self.billing,
        })
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_amount(name: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| anyhow!("{name} must be a number"))
}

pub(crate) fn parse_http_url(what: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| anyhow!("invalid {what} '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!("{what} must use http or https, got '{other}'")),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
