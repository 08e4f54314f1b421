//! Server key data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol tag detected from a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Vmess,
    Vless,
    VlessReality,
    Trojan,
    Shadowsocks,
    #[serde(rename = "shadowsocks-2022")]
    Shadowsocks2022,
    Hysteria2,
    Tuic,
    Ssh,
    #[default]
    Unknown,
}

impl Protocol {
    pub const ALL: [Protocol; 10] = [
        Protocol::Vmess,
        Protocol::Vless,
        Protocol::VlessReality,
        Protocol::Trojan,
        Protocol::Shadowsocks,
        Protocol::Shadowsocks2022,
        Protocol::Hysteria2,
        Protocol::Tuic,
        Protocol::Ssh,
        Protocol::Unknown,
    ];

    /// Stable tag used for identities, filters and storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::VlessReality => "vless-reality",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Shadowsocks2022 => "shadowsocks-2022",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Ssh => "ssh",
            Protocol::Unknown => "unknown",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Vmess => "VMess",
            Protocol::Vless => "VLESS",
            Protocol::VlessReality => "VLESS+Reality",
            Protocol::Trojan => "Trojan",
            Protocol::Shadowsocks => "Shadowsocks",
            Protocol::Shadowsocks2022 => "SS2022",
            Protocol::Hysteria2 => "Hysteria2",
            Protocol::Tuic => "TUIC",
            Protocol::Ssh => "SSH",
            Protocol::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == lowered || p.label().to_lowercase() == lowered)
            .ok_or_else(|| ParseError::UnsupportedScheme(s.to_string()))
    }
}

/// Why a descriptor could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unsupported protocol: {0}")]
    UnsupportedScheme(String),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("invalid JSON payload: {0}")]
    Json(String),
    #[error("invalid URI: {0}")]
    Uri(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("malformed descriptor: {0}")]
    Malformed(String),
}

/// Common accessors shared by every protocol configuration
pub trait Endpoint {
    fn name(&self) -> &str;
    fn host(&self) -> Option<&str>;
    fn port(&self) -> Option<u16>;
    fn protocol(&self) -> Protocol;

    /// `host:port`, or an empty string when either is missing
    fn address(&self) -> String {
        match (self.host(), self.port()) {
            (Some(host), Some(port)) if host.contains(':') => format!("[{}]:{}", host, port),
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => String::new(),
        }
    }
}

/// VMess: the whole JSON object is retained
#[derive(Debug, Clone, PartialEq)]
pub struct VmessConfig {
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub id: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl VmessConfig {
    /// Look up any passthrough field as a string
    pub fn field(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub id: String,
    pub network: String,
    pub header_type: String,
    pub security: String,
    pub flow: String,
    pub sni: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub path: String,
    pub host_header: String,
    pub alpn: String,
}

impl VlessConfig {
    pub fn is_reality(&self) -> bool {
        self.security == "reality"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub network: String,
    pub security: String,
    pub sni: String,
    pub alpn: String,
    pub path: String,
    pub host_header: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub plugin: Option<String>,
}

impl ShadowsocksConfig {
    pub fn is_2022(&self) -> bool {
        self.method.starts_with("2022-")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hysteria2Config {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub obfs: String,
    pub obfs_password: String,
    pub sni: String,
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuicConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub uuid: String,
    pub password: String,
    pub congestion_control: String,
    pub alpn: String,
    pub sni: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// A descriptor that could not be normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfig {
    pub protocol: Protocol,
    pub name: String,
    pub error: ParseError,
}

/// Normalized configuration of a single server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerConfig {
    Vmess(VmessConfig),
    Vless(VlessConfig),
    Trojan(TrojanConfig),
    Shadowsocks(ShadowsocksConfig),
    Hysteria2(Hysteria2Config),
    Tuic(TuicConfig),
    Ssh(SshConfig),
    Invalid(InvalidConfig),
}

impl ServerConfig {
    pub fn invalid(protocol: Protocol, name: &str, error: ParseError) -> Self {
        ServerConfig::Invalid(InvalidConfig {
            protocol,
            name: name.to_string(),
            error,
        })
    }

    pub fn error(&self) -> Option<&ParseError> {
        match self {
            ServerConfig::Invalid(invalid) => Some(&invalid.error),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error().is_none()
    }
}

impl Endpoint for ServerConfig {
    fn name(&self) -> &str {
        match self {
            ServerConfig::Vmess(c) => &c.name,
            ServerConfig::Vless(c) => &c.name,
            ServerConfig::Trojan(c) => &c.name,
            ServerConfig::Shadowsocks(c) => &c.name,
            ServerConfig::Hysteria2(c) => &c.name,
            ServerConfig::Tuic(c) => &c.name,
            ServerConfig::Ssh(c) => &c.name,
            ServerConfig::Invalid(c) => &c.name,
        }
    }

    fn host(&self) -> Option<&str> {
        let host = match self {
            ServerConfig::Vmess(c) => c.host.as_deref()?,
            ServerConfig::Vless(c) => c.host.as_str(),
            ServerConfig::Trojan(c) => c.host.as_str(),
            ServerConfig::Shadowsocks(c) => c.host.as_str(),
            ServerConfig::Hysteria2(c) => c.host.as_str(),
            ServerConfig::Tuic(c) => c.host.as_str(),
            ServerConfig::Ssh(c) => c.host.as_str(),
            ServerConfig::Invalid(_) => return None,
        };
        (!host.is_empty()).then_some(host)
    }

    fn port(&self) -> Option<u16> {
        match self {
            ServerConfig::Vmess(c) => c.port,
            ServerConfig::Vless(c) => Some(c.port),
            ServerConfig::Trojan(c) => Some(c.port),
            ServerConfig::Shadowsocks(c) => Some(c.port),
            ServerConfig::Hysteria2(c) => Some(c.port),
            ServerConfig::Tuic(c) => Some(c.port),
            ServerConfig::Ssh(c) => Some(c.port),
            ServerConfig::Invalid(_) => None,
        }
    }

    fn protocol(&self) -> Protocol {
        match self {
            ServerConfig::Vmess(_) => Protocol::Vmess,
            ServerConfig::Vless(c) if c.is_reality() => Protocol::VlessReality,
            ServerConfig::Vless(_) => Protocol::Vless,
            ServerConfig::Trojan(_) => Protocol::Trojan,
            ServerConfig::Shadowsocks(c) if c.is_2022() => Protocol::Shadowsocks2022,
            ServerConfig::Shadowsocks(_) => Protocol::Shadowsocks,
            ServerConfig::Hysteria2(_) => Protocol::Hysteria2,
            ServerConfig::Tuic(_) => Protocol::Tuic,
            ServerConfig::Ssh(_) => Protocol::Ssh,
            ServerConfig::Invalid(c) => c.protocol,
        }
    }
}
