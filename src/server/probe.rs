//! Probe engine: TCP reachability, latency and optional geo lookup

use crate::server::geo::{GeoInfo, GeoResolver, DEFAULT_GEO_SERVICES, DEFAULT_GEO_TIMEOUT_SECS};
use crate::server::models::Endpoint;
use crate::server::record::ServerKey;
use crate::Result;
use chrono::Utc;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};

/// Default connect timeout for a probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of concurrent probes in a batch
const DEFAULT_CONCURRENCY: usize = 10;

/// What a probe measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// TCP connect latency only
    #[default]
    Latency,
    /// Latency plus public IP and country
    Full,
    /// Full plus throughput; throughput is not measured and stays empty
    Speed,
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMode::Latency => write!(f, "latency"),
            ProbeMode::Full => write!(f, "full"),
            ProbeMode::Speed => write!(f, "speed"),
        }
    }
}

impl FromStr for ProbeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "latency" => Ok(ProbeMode::Latency),
            "full" => Ok(ProbeMode::Full),
            "speed" => Ok(ProbeMode::Speed),
            _ => Err(anyhow::anyhow!(
                "Invalid probe mode: {}. Use: latency, full, speed",
                s
            )),
        }
    }
}

/// Why a probe failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("missing host or port")]
    MissingEndpoint,
    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("connection refused")]
    Refused,
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Outcome of the reachability part of a probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    Reachable { latency_ms: f64 },
    Failed(ProbeError),
}

/// Result of probing a single server
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub download_speed: Option<f64>,
    pub upload_speed: Option<f64>,
}

impl ProbeResult {
    pub fn reachable(latency_ms: f64) -> Self {
        Self {
            status: ProbeStatus::Reachable { latency_ms },
            ip: None,
            country: None,
            download_speed: None,
            upload_speed: None,
        }
    }

    pub fn failed(error: ProbeError) -> Self {
        Self {
            status: ProbeStatus::Failed(error),
            ip: None,
            country: None,
            download_speed: None,
            upload_speed: None,
        }
    }

    pub fn with_geo(mut self, geo: GeoInfo) -> Self {
        self.ip = geo.ip;
        self.country = geo.country;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ProbeStatus::Reachable { .. })
    }

    pub fn latency_ms(&self) -> Option<f64> {
        match self.status {
            ProbeStatus::Reachable { latency_ms } => Some(latency_ms),
            ProbeStatus::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match &self.status {
            ProbeStatus::Reachable { .. } => None,
            ProbeStatus::Failed(error) => Some(error),
        }
    }
}

/// Throughput numbers; always empty since no data is relayed through the server
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpeedSample {
    pub download: Option<f64>,
    pub upload: Option<f64>,
}

/// Configuration for the probe engine
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Connect timeout for each probe
    pub timeout: Duration,
    /// Number of concurrent probes in a batch
    pub concurrency: usize,
    /// Per-request timeout for geo services
    pub geo_timeout: Duration,
    /// Geo services in priority order
    pub geo_services: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            geo_timeout: Duration::from_secs(DEFAULT_GEO_TIMEOUT_SECS),
            geo_services: DEFAULT_GEO_SERVICES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_geo_timeout(mut self, timeout: Duration) -> Self {
        self.geo_timeout = timeout;
        self
    }

    pub fn with_geo_services(mut self, services: Vec<String>) -> Self {
        self.geo_services = services;
        self
    }
}

/// Probe engine for measuring server reachability
#[derive(Clone)]
pub struct Prober {
    config: ProbeConfig,
    geo: GeoResolver,
}

impl Prober {
    /// Create a prober with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(ProbeConfig::default())
    }

    /// Create a prober with custom configuration
    pub fn with_config(config: ProbeConfig) -> Result<Self> {
        let geo = GeoResolver::new(config.geo_services.clone(), config.geo_timeout)?;
        Ok(Self { config, geo })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe a key and fold the result into its statistics
    pub async fn probe(&self, key: &mut ServerKey, mode: ProbeMode) -> ProbeResult {
        let result = self.check(&key.config, mode).await;

        // No suspension point between here and the end of the update.
        key.record_probe(&result, Utc::now());

        match &result.status {
            ProbeStatus::Reachable { latency_ms } => tracing::info!(
                key_id = %key.id,
                address = %key.config.address(),
                latency_ms,
                "probe succeeded"
            ),
            ProbeStatus::Failed(error) => tracing::info!(
                key_id = %key.id,
                address = %key.config.address(),
                %error,
                "probe failed"
            ),
        }

        result
    }

    /// Probe an endpoint without touching any record
    pub async fn check<E: Endpoint + ?Sized>(&self, endpoint: &E, mode: ProbeMode) -> ProbeResult {
        let latency_ms = match self.measure_latency(endpoint.host(), endpoint.port()).await {
            Ok(latency_ms) => latency_ms,
            Err(error) => return ProbeResult::failed(error),
        };

        let mut result = ProbeResult::reachable(latency_ms);

        if matches!(mode, ProbeMode::Full | ProbeMode::Speed) {
            if let Some(geo) = self.geo.lookup().await {
                result = result.with_geo(geo);
            }
        }

        if mode == ProbeMode::Speed {
            let speed = self.test_speed(endpoint).await;
            result.download_speed = speed.download;
            result.upload_speed = speed.upload;
        }

        result
    }

    /// Time a TCP connect (including name resolution), in milliseconds with two decimals
    pub async fn measure_latency(
        &self,
        host: Option<&str>,
        port: Option<u16>,
    ) -> std::result::Result<f64, ProbeError> {
        let (Some(host), Some(port)) = (host, port) else {
            return Err(ProbeError::MissingEndpoint);
        };

        let start = Instant::now();
        match tokio::time::timeout(self.config.timeout, connect(host, port)).await {
            Ok(Ok(_stream)) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                Ok((elapsed * 100.0).round() / 100.0)
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ProbeError::Timeout(self.config.timeout)),
        }
    }

    /// Throughput test placeholder
    pub async fn test_speed<E: Endpoint + ?Sized>(&self, _endpoint: &E) -> SpeedSample {
        SpeedSample::default()
    }
}

async fn connect(host: &str, port: u16) -> std::result::Result<TcpStream, ProbeError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => ProbeError::Refused,
        Some(e) => ProbeError::Connect(e.to_string()),
        None => ProbeError::Resolve {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        },
    })
}
