//! Server records: identity, configuration and rolling statistics

use crate::server::models::{Endpoint, Protocol, ServerConfig};
use crate::server::parser::KeyParser;
use crate::server::probe::ProbeResult;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use std::collections::VecDeque;
use std::fmt;

/// Maximum number of latency samples kept per record
pub const MAX_LATENCY_SAMPLES: usize = 100;

/// Number of most recent samples used for the average latency
pub const AVERAGE_WINDOW: usize = 10;

/// Default group for keys imported by hand
pub const DEFAULT_GROUP: &str = "Default";

/// Deterministic identity of a server, shared by descriptors with the same endpoint
pub fn make_identity(host: Option<&str>, port: Option<u16>, protocol: Protocol) -> String {
    let key_data = format!(
        "{}:{}:{}",
        host.unwrap_or_default(),
        port.map(|p| p.to_string()).unwrap_or_default(),
        protocol
    );
    let digest = Md5::digest(key_data.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

/// Bounded latency history; the oldest sample is evicted first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyHistory {
    samples: VecDeque<f64>,
}

impl LatencyHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_LATENCY_SAMPLES),
        }
    }

    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == MAX_LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in insertion order, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &f64> + ExactSizeIterator {
        self.samples.iter()
    }

    /// The last `n` samples, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &f64> {
        self.samples.iter().skip(self.samples.len().saturating_sub(n))
    }

    /// Mean of the last `n` samples
    pub fn mean_of_last(&self, n: usize) -> Option<f64> {
        let count = self.samples.len().min(n);
        if count == 0 {
            return None;
        }
        Some(self.recent(n).sum::<f64>() / count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }
}

/// A single imported proxy key with its rolling statistics
#[derive(Debug, Clone)]
pub struct ServerKey {
    pub id: String,
    pub raw: String,
    pub config: ServerConfig,
    pub protocol: Protocol,
    /// Display name, editable by the user
    pub name: String,
    pub group: String,
    pub latency_history: LatencyHistory,
    pub total_tests: u32,
    pub successful_tests: u32,
    /// Start of the current success streak; `None` after any failed probe
    pub online_since: Option<DateTime<Utc>>,
    pub last_test_time: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub download_speed: Option<f64>,
    pub upload_speed: Option<f64>,
    pub is_favorite: bool,
    pub notes: String,
}

impl ServerKey {
    /// Parse a descriptor into a fresh record with zeroed statistics
    pub fn new(raw: &str, group: &str) -> Self {
        let config = KeyParser::parse(raw);
        let protocol = config.protocol();
        let id = make_identity(config.host(), config.port(), protocol);

        Self {
            id,
            raw: raw.to_string(),
            name: config.name().to_string(),
            protocol,
            config,
            group: group.to_string(),
            latency_history: LatencyHistory::new(),
            total_tests: 0,
            successful_tests: 0,
            online_since: None,
            last_test_time: None,
            ip_address: None,
            country: None,
            download_speed: None,
            upload_speed: None,
            is_favorite: false,
            notes: String::new(),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.config.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.config.port()
    }

    /// Name with a favorite marker
    pub fn display_name(&self) -> String {
        if self.is_favorite {
            format!("★ {}", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Raw descriptor for re-export
    pub fn share_link(&self) -> &str {
        &self.raw
    }

    /// Mean of the most recent samples
    pub fn average_latency(&self) -> Option<f64> {
        self.latency_history.mean_of_last(AVERAGE_WINDOW)
    }

    /// Successful probes as a percentage; zero when never probed
    pub fn success_rate(&self) -> f64 {
        if self.total_tests == 0 {
            return 0.0;
        }
        f64::from(self.successful_tests) / f64::from(self.total_tests) * 100.0
    }

    /// Time since the current success streak started
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.online_since.map(|since| now - since)
    }

    pub fn uptime_minutes(&self, now: DateTime<Utc>) -> i64 {
        self.uptime(now).map_or(0, |d| d.num_minutes())
    }

    pub fn is_online(&self) -> bool {
        self.online_since.is_some()
    }

    pub fn is_tested(&self) -> bool {
        self.total_tests > 0
    }

    /// Fold one probe result into the rolling statistics
    pub fn record_probe(&mut self, result: &ProbeResult, now: DateTime<Utc>) {
        self.total_tests += 1;

        match result.latency_ms() {
            Some(latency_ms) => {
                self.successful_tests += 1;
                self.latency_history.push(latency_ms);
                self.online_since.get_or_insert(now);
            }
            None => self.online_since = None,
        }

        self.last_test_time = Some(now);
        if let Some(ip) = &result.ip {
            self.ip_address = Some(ip.clone());
        }
        if let Some(country) = &result.country {
            self.country = Some(country.clone());
        }
        if let Some(download) = result.download_speed {
            self.download_speed = Some(download);
        }
        if let Some(upload) = result.upload_speed {
            self.upload_speed = Some(upload);
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.protocol.label(), self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::probe::{ProbeError, ProbeResult};

    fn key() -> ServerKey {
        ServerKey::new("vless://id@example.com:443#Node", DEFAULT_GROUP)
    }

    #[test]
    fn test_identity_is_short_hex() {
        let id = make_identity(Some("example.com"), Some(443), Protocol::Vless);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(id, make_identity(Some("example.com"), Some(443), Protocol::Vless));
        assert_ne!(id, make_identity(Some("example.com"), Some(443), Protocol::Trojan));
        assert_ne!(id, make_identity(Some("example.com"), Some(8443), Protocol::Vless));
    }

    #[test]
    fn test_identity_ignores_name_and_path() {
        let a = ServerKey::new("vless://id@example.com:443?path=%2Fa#First", DEFAULT_GROUP);
        let b = ServerKey::new("vless://other@example.com:443?path=%2Fb#Second", "Sub:x");
        assert_eq!(a.id, b.id);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_new_key_is_zeroed() {
        let key = key();
        assert_eq!(key.name, "Node");
        assert_eq!(key.protocol, Protocol::Vless);
        assert_eq!(key.share_link(), "vless://id@example.com:443#Node");
        assert_eq!(key.total_tests, 0);
        assert_eq!(key.successful_tests, 0);
        assert!(key.latency_history.is_empty());
        assert!(key.online_since.is_none());
        assert_eq!(key.success_rate(), 0.0);
        assert!(key.average_latency().is_none());
    }

    #[test]
    fn test_history_cap_keeps_most_recent() {
        let mut history = LatencyHistory::new();
        for i in 0..150 {
            history.push(i as f64);
        }
        assert_eq!(history.len(), MAX_LATENCY_SAMPLES);
        let samples: Vec<f64> = history.iter().copied().collect();
        let expected: Vec<f64> = (50..150).map(|i| i as f64).collect();
        assert_eq!(samples, expected);
    }

    #[test]
    fn test_record_probe_caps_history() {
        let mut key = key();
        let now = Utc::now();
        for i in 0..150 {
            key.record_probe(&ProbeResult::reachable(i as f64), now);
        }
        assert_eq!(key.total_tests, 150);
        assert_eq!(key.successful_tests, 150);
        assert_eq!(key.latency_history.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(key.latency_history.iter().next(), Some(&50.0));
        assert_eq!(key.latency_history.iter().last(), Some(&149.0));
        assert_eq!(key.latency_history.min(), Some(50.0));
    }

    #[test]
    fn test_average_uses_last_ten() {
        let mut key = key();
        let now = Utc::now();
        for i in 1..=15 {
            key.record_probe(&ProbeResult::reachable(i as f64 * 10.0), now);
        }
        // samples 6..=15 -> 60..=150
        assert_eq!(key.average_latency(), Some(105.0));
        assert_eq!(key.latency_history.min(), Some(10.0));
        assert_eq!(key.latency_history.max(), Some(150.0));
    }

    #[test]
    fn test_record_probe_counters_and_streak() {
        let mut key = key();
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);

        key.record_probe(&ProbeResult::reachable(42.0), t0);
        key.record_probe(&ProbeResult::reachable(44.0), t1);
        assert_eq!(key.total_tests, 2);
        assert_eq!(key.successful_tests, 2);
        assert_eq!(key.online_since, Some(t0));
        assert_eq!(key.uptime_minutes(t1), 5);

        key.record_probe(&ProbeResult::failed(ProbeError::MissingEndpoint), t1);
        assert_eq!(key.total_tests, 3);
        assert_eq!(key.successful_tests, 2);
        assert!(key.online_since.is_none());
        assert_eq!(key.uptime(t1), None);
        assert_eq!(key.latency_history.len(), 2);
        assert_eq!(key.last_test_time, Some(t1));

        let rate = key.success_rate();
        assert!((rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_probe_keeps_geo_until_replaced() {
        let mut key = key();
        let now = Utc::now();
        let mut result = ProbeResult::reachable(10.0);
        result.ip = Some("203.0.113.7".to_string());
        result.country = Some("Japan".to_string());
        key.record_probe(&result, now);

        key.record_probe(&ProbeResult::reachable(12.0), now);
        assert_eq!(key.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(key.country.as_deref(), Some("Japan"));
        assert!(key.download_speed.is_none());
    }

    #[test]
    fn test_display_name_marks_favorite() {
        let mut key = key();
        assert_eq!(key.display_name(), "Node");
        key.is_favorite = true;
        assert_eq!(key.display_name(), "★ Node");
    }
}
