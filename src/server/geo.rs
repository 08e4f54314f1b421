//! Public IP and country lookup through third-party HTTP services

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default per-request timeout for geo services
pub const DEFAULT_GEO_TIMEOUT_SECS: u64 = 5;

/// Services tried in order; the first usable answer wins
pub const DEFAULT_GEO_SERVICES: [&str; 3] = [
    "https://ipapi.co/json/",
    "http://ip-api.com/json/",
    "https://api.ipify.org?format=json",
];

/// IP address and country reported by a geo service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoInfo {
    pub ip: Option<String>,
    pub country: Option<String>,
}

impl GeoInfo {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.country.is_none()
    }

    /// Interpret a service response by the keys it carries
    ///
    /// - `country_name` (ipapi.co): `ip` + `country_name`
    /// - `country` (ip-api.com): `query` or `ip` + `country`
    /// - otherwise (ipify): `ip` only
    ///
    /// Anything that is not an object, or an IP-only answer without an `ip`,
    /// yields `None`.
    pub fn from_response(data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let info = if object.contains_key("country_name") {
            GeoInfo {
                ip: text("ip"),
                country: text("country_name"),
            }
        } else if object.contains_key("country") {
            GeoInfo {
                ip: text("query").or_else(|| text("ip")),
                country: text("country"),
            }
        } else {
            GeoInfo {
                ip: Some(text("ip")?),
                country: None,
            }
        };

        Some(info)
    }
}

impl std::fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.ip, &self.country) {
            (Some(ip), Some(country)) => write!(f, "{} ({})", ip, country),
            (Some(ip), None) => write!(f, "{}", ip),
            (None, Some(country)) => write!(f, "{}", country),
            (None, None) => write!(f, "Unknown"),
        }
    }
}

/// Resolves the public IP and country through an ordered list of services
#[derive(Clone)]
pub struct GeoResolver {
    client: Client,
    services: Vec<String>,
}

impl GeoResolver {
    pub fn new(services: Vec<String>, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, services })
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Query each service in order; every failure just moves on to the next one
    pub async fn lookup(&self) -> Option<GeoInfo> {
        for service in &self.services {
            match self.query(service).await {
                Ok(Some(info)) => {
                    tracing::debug!(service = %service, geo = %info, "geo lookup succeeded");
                    return Some(info);
                }
                Ok(None) => {
                    tracing::debug!(service = %service, "geo service returned no usable data");
                }
                Err(e) => {
                    tracing::debug!(service = %service, error = %e, "geo service failed");
                }
            }
        }
        None
    }

    async fn query(&self, service: &str) -> crate::Result<Option<GeoInfo>> {
        let response = self.client.get(service).send().await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let data: Value = response.json().await?;
        Ok(GeoInfo::from_response(&data))
    }
}
