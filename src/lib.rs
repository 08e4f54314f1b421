//! Key Probe - Proxy Key Parser and Tester
//!
//! Parses share-link descriptors for common proxy protocols, probes the
//! advertised endpoints concurrently and ranks them by speed and stability.

pub mod database;
pub mod logging;
pub mod server;
pub mod tui;

pub use server::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Environment variable that overrides the database path
pub const DATABASE_ENV: &str = "KEYPROBE_DATABASE";

/// Default database file
pub const DEFAULT_DATABASE: &str = "keyprobe.db";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path or `sqlite:` URL
    pub database_url: String,
    pub probe: ProbeConfig,
    pub subscription: SubscriptionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE.to_string(),
            probe: ProbeConfig::default(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, database_url: String) -> Self {
        self.database_url = database_url;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }
}
