//! Subscription registry and fetcher
//!
//! A subscription is a URL serving a list of descriptors, optionally encoded
//! as one base64 blob. Fetch failures are reported in [`SubscriptionResult`]
//! and never abort an update run.

use crate::server::collection::{ImportReport, KeyList};
use crate::server::parser::decode_base64_text;
use crate::Result;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Default timeout for subscription requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for subscription requests
const DEFAULT_USER_AGENT: &str = concat!("keyprobe/", env!("CARGO_PKG_VERSION"));

/// Prefix of the group label given to keys from a subscription
pub const GROUP_PREFIX: &str = "Sub:";

/// Identity of a subscription, derived from its URL
pub fn subscription_id(url: &str) -> String {
    let digest = Md5::digest(url.as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

/// Split a subscription body into descriptor lines
///
/// The whole body is tried as base64 first; if that fails the text is used as is.
pub fn decode_subscription(body: &str) -> Vec<String> {
    let content = match decode_base64_text(body) {
        Ok(decoded) => decoded,
        Err(_) => body.to_string(),
    };

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// A registered subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// Number of descriptor lines in the last successful fetch
    pub server_count: usize,
}

impl Subscription {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            id: subscription_id(url),
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
            last_update: None,
            server_count: 0,
        }
    }

    /// Group label for keys imported from this subscription
    pub fn group(&self) -> String {
        format!("{}{}", GROUP_PREFIX, self.name)
    }
}

/// Result of updating a single subscription
#[derive(Debug, Clone)]
pub struct SubscriptionResult {
    /// Name of the subscription, or the requested id if it is unknown
    pub source: String,
    pub group: String,
    /// Descriptor lines from the subscription
    pub keys: Vec<String>,
    /// Error message if the update failed
    pub error: Option<String>,
}

impl SubscriptionResult {
    pub fn success(source: String, group: String, keys: Vec<String>) -> Self {
        Self {
            source,
            group,
            keys,
            error: None,
        }
    }

    pub fn failure(source: String, group: String, error: String) -> Self {
        Self {
            source,
            group,
            keys: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Add the fetched descriptors to a key list under the subscription's group
    pub fn import_into(&self, list: &mut KeyList) -> ImportReport {
        list.import(&self.keys.join("\n"), &self.group)
    }
}

/// Configuration for subscription fetching
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SubscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Registry of subscriptions with an HTTP client to refresh them
pub struct SubscriptionManager {
    client: Client,
    subscriptions: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Result<Self> {
        Self::with_config(SubscriptionConfig::default())
    }

    pub fn with_config(config: SubscriptionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            subscriptions: Vec::new(),
        })
    }

    /// Replace the registry, e.g. with subscriptions loaded from the store
    pub fn with_subscriptions(mut self, subscriptions: Vec<Subscription>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    /// Register a subscription; the URL must be absolute and not yet registered
    pub fn add(&mut self, name: &str, url: &str) -> Result<&Subscription> {
        Url::parse(url).map_err(|e| anyhow!("Invalid subscription URL {}: {}", url, e))?;

        let subscription = Subscription::new(name, url);
        if self.get(&subscription.id).is_some() {
            return Err(anyhow!("Subscription already exists: {}", url));
        }

        tracing::info!(sub_id = %subscription.id, name, url, "subscription added");
        let index = self.subscriptions.len();
        self.subscriptions.push(subscription);
        Ok(&self.subscriptions[index])
    }

    pub fn remove(&mut self, id: &str) -> Option<Subscription> {
        let index = self.subscriptions.iter().position(|s| s.id == id)?;
        Some(self.subscriptions.remove(index))
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.subscriptions.iter_mut().find(|s| s.id == id) {
            Some(subscription) => {
                subscription.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Fetch the raw body of a subscription URL
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Refresh one subscription and record its update time and size
    pub async fn update(&mut self, id: &str) -> SubscriptionResult {
        let Some(subscription) = self.get(id) else {
            return SubscriptionResult::failure(
                id.to_string(),
                String::new(),
                format!("Subscription not found: {}", id),
            );
        };
        let name = subscription.name.clone();
        let group = subscription.group();
        let url = subscription.url.clone();

        let body = match self.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(sub_id = %id, %url, error = %e, "subscription update failed");
                return SubscriptionResult::failure(name, group, e.to_string());
            }
        };

        let keys = decode_subscription(&body);
        if let Some(subscription) = self.subscriptions.iter_mut().find(|s| s.id == id) {
            subscription.last_update = Some(Utc::now());
            subscription.server_count = keys.len();
        }

        tracing::info!(sub_id = %id, count = keys.len(), "subscription updated");
        SubscriptionResult::success(name, group, keys)
    }

    /// Refresh every enabled subscription in registration order
    pub async fn update_all(&mut self) -> Vec<SubscriptionResult> {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.update(&id).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LINES: &str = "vless://id@a.test:443#A\r\n\r\n  trojan://pw@b.test:443#B  \nnot-a-key\n";

    async fn serve(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/sub", addr)
    }

    fn manager() -> SubscriptionManager {
        SubscriptionManager::with_config(SubscriptionConfig::new().with_timeout(Duration::from_secs(2)))
            .unwrap()
    }

    #[test]
    fn test_subscription_config_default() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.user_agent.starts_with("keyprobe/"));
    }

    #[test]
    fn test_decode_base64_and_plain_agree() {
        let plain = decode_subscription(LINES);
        let encoded = STANDARD.encode(LINES);
        // Providers often wrap the blob
        let wrapped = format!("{}\n{}", &encoded[..20], &encoded[20..]);
        assert_eq!(decode_subscription(&wrapped), plain);
        assert_eq!(
            plain,
            vec!["vless://id@a.test:443#A", "trojan://pw@b.test:443#B", "not-a-key"]
        );
    }

    #[test]
    fn test_subscription_identity() {
        let sub = Subscription::new("free", "https://example.com/sub");
        assert_eq!(sub.id.len(), 8);
        assert_eq!(sub.id, subscription_id("https://example.com/sub"));
        assert_eq!(sub.group(), "Sub:free");
        assert!(sub.enabled);
        assert_eq!(sub.server_count, 0);
    }

    #[test]
    fn test_registry() {
        let mut manager = manager();
        let id = manager.add("one", "https://example.com/a").unwrap().id.clone();
        assert!(manager.add("again", "https://example.com/a").is_err());
        assert!(manager.add("bad", "not a url").is_err());
        manager.add("two", "https://example.com/b").unwrap();
        assert_eq!(manager.subscriptions().len(), 2);

        assert!(manager.set_enabled(&id, false));
        assert!(!manager.get(&id).unwrap().enabled);
        assert_eq!(manager.remove(&id).unwrap().name, "one");
        assert!(manager.remove(&id).is_none());
        assert!(!manager.set_enabled(&id, true));
    }

    #[tokio::test]
    async fn test_update_imports_keys() {
        let url = serve("200 OK", STANDARD.encode(LINES)).await;
        let mut manager = manager();
        let id = manager.add("local", &url).unwrap().id.clone();

        let result = manager.update(&id).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.source, "local");
        assert_eq!(result.keys.len(), 3);

        let sub = manager.get(&id).unwrap();
        assert_eq!(sub.server_count, 3);
        assert!(sub.last_update.is_some());

        let mut list = KeyList::new();
        let report = result.import_into(&mut list);
        assert_eq!(report.added, 2);
        assert_eq!(report.rejected, 1);
        assert!(list.iter().all(|k| k.group == "Sub:local"));
    }

    #[tokio::test]
    async fn test_update_failures_are_values() {
        let url = serve("404 Not Found", String::new()).await;
        let mut manager = manager();
        let id = manager.add("missing", &url).unwrap().id.clone();

        let result = manager.update(&id).await;
        assert!(!result.is_success());
        assert!(result.keys.is_empty());
        assert!(manager.get(&id).unwrap().last_update.is_none());

        let unknown = manager.update("00000000").await;
        assert!(!unknown.is_success());
    }

    #[tokio::test]
    async fn test_update_all_skips_disabled() {
        let url = serve("200 OK", "ssh://u@c.test:22#C".to_string()).await;
        let mut manager = manager();
        manager.add("on", &url).unwrap();
        let off = manager
            .add("off", "http://127.0.0.1:1/never")
            .unwrap()
            .id
            .clone();
        manager.set_enabled(&off, false);

        let results = manager.update_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].keys, vec!["ssh://u@c.test:22#C"]);
    }
}
