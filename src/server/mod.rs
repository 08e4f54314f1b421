//! Server keys: parsing, probing and ranking
//!
//! This module provides functionality for:
//! - Parsing share-link descriptors (vmess, vless, trojan, ss, hysteria2, tuic, ssh)
//! - Probing servers for reachability and latency, one at a time or in batches
//! - Ranking keys and aggregating statistics over a collection
//! - Rendering text reports for keys and collections
//! - Managing key lists and subscriptions

pub mod batch;
pub mod collection;
pub mod geo;
pub mod models;
pub mod parser;
pub mod probe;
pub mod ranking;
pub mod record;
pub mod report;
pub mod subscription;

pub use batch::{BatchEvent, BatchItem, BatchProgress, BatchReporter, BatchRunner, BatchSummary};
pub use collection::{ImportReport, KeyFilter, KeyList};
pub use geo::{GeoInfo, GeoResolver};
pub use models::{Endpoint, ParseError, Protocol, ServerConfig};
pub use parser::KeyParser;
pub use probe::{ProbeConfig, ProbeError, ProbeMode, ProbeResult, ProbeStatus, Prober};
pub use ranking::{BestCategory, CollectionStats, KeyStatus, LatencyClass};
pub use record::{LatencyHistory, ServerKey, DEFAULT_GROUP};
pub use report::{KeyDetails, Rankings, ResultLine, StatsReport};
pub use subscription::{Subscription, SubscriptionConfig, SubscriptionManager, SubscriptionResult};
