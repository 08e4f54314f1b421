//! Read-only rankings and aggregates over a key collection

use crate::server::models::Protocol;
use crate::server::record::ServerKey;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Minimum number of probes before a key is ranked for stability
pub const MIN_TESTS_FOR_STABILITY: u32 = 3;

/// Latency above which a poorly performing key counts as very slow
pub const WORST_LATENCY_MS: f64 = 500.0;

/// Success rate below which a very slow key is worst
pub const WORST_SLOW_SUCCESS_RATE: f64 = 50.0;

/// Success rate below which any key is worst
pub const WORST_SUCCESS_RATE: f64 = 30.0;

/// Sort key stand-in for "no latency" in the stability ranking
const NO_LATENCY_SENTINEL: f64 = 1.0e12;

/// Keys with a known average latency, fastest first
pub fn fastest(keys: &[ServerKey]) -> Vec<&ServerKey> {
    let mut ranked: Vec<(&ServerKey, f64)> = keys
        .iter()
        .filter_map(|k| k.average_latency().map(|avg| (k, avg)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.into_iter().map(|(k, _)| k).collect()
}

/// Keys probed at least three times, by success rate then lower latency
///
/// Keys without latency sort last among keys with the same success rate.
pub fn most_stable(keys: &[ServerKey]) -> Vec<&ServerKey> {
    let stability = |k: &ServerKey| {
        let latency = k
            .average_latency()
            .map_or(-NO_LATENCY_SENTINEL, |avg| -avg);
        (k.success_rate(), latency)
    };

    let mut ranked: Vec<&ServerKey> = keys
        .iter()
        .filter(|k| k.total_tests >= MIN_TESTS_FOR_STABILITY)
        .collect();
    ranked.sort_by(|a, b| {
        let (rate_a, lat_a) = stability(a);
        let (rate_b, lat_b) = stability(b);
        rate_b
            .total_cmp(&rate_a)
            .then_with(|| lat_b.total_cmp(&lat_a))
    });
    ranked
}

/// Score used by [`auto_best`]; the `+ 1` damps near-zero latencies
pub fn best_score(key: &ServerKey) -> Option<f64> {
    if key.total_tests < MIN_TESTS_FOR_STABILITY {
        return None;
    }
    let avg = key.average_latency()?;
    Some(key.success_rate() / (avg + 1.0))
}

/// The single key with the best balance of reliability and speed
///
/// On equal scores the key that comes first in the collection wins.
pub fn auto_best(keys: &[ServerKey]) -> Option<&ServerKey> {
    let mut best: Option<(&ServerKey, f64)> = None;
    for key in keys {
        let Some(score) = best_score(key) else {
            continue;
        };
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((key, score)),
        }
    }
    best.map(|(k, _)| k)
}

/// Whether a key should be pruned as one of the worst performers
///
/// Never-probed keys are never worst.
pub fn is_worst(key: &ServerKey) -> bool {
    if !key.is_tested() {
        return false;
    }

    let rate = key.success_rate();
    let is_dead = !key.is_online();
    let is_very_slow = key
        .average_latency()
        .is_some_and(|avg| avg > WORST_LATENCY_MS && rate < WORST_SLOW_SUCCESS_RATE);
    let is_unstable = rate < WORST_SUCCESS_RATE;

    is_dead || is_very_slow || is_unstable
}

pub fn worst_keys(keys: &[ServerKey]) -> Vec<&ServerKey> {
    keys.iter().filter(|k| is_worst(k)).collect()
}

/// Keys in a success streak, longest running first
pub fn longest_uptime(keys: &[ServerKey], now: DateTime<Utc>) -> Vec<&ServerKey> {
    let mut ranked: Vec<(&ServerKey, chrono::Duration)> = keys
        .iter()
        .filter_map(|k| k.uptime(now).map(|d| (k, d)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.into_iter().map(|(k, _)| k).collect()
}

/// Number of keys in a best-keys export
pub const BEST_KEYS_COUNT: usize = 5;

/// Ranking a best-keys export is taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestCategory {
    Fastest,
    Stable,
}

impl FromStr for BestCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "fastest" | "fast" => Ok(BestCategory::Fastest),
            "stable" => Ok(BestCategory::Stable),
            _ => Err(anyhow::anyhow!(
                "Invalid category: {}. Use: fastest, stable",
                s
            )),
        }
    }
}

/// The top `count` keys of one ranking
pub fn best_keys(keys: &[ServerKey], category: BestCategory, count: usize) -> Vec<&ServerKey> {
    let ranked = match category {
        BestCategory::Fastest => fastest(keys),
        BestCategory::Stable => most_stable(keys),
    };
    ranked.into_iter().take(count).collect()
}

/// Latency bucket used for colouring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    Excellent,
    Good,
    Slow,
}

impl LatencyClass {
    pub fn of(latency_ms: f64) -> Self {
        if latency_ms < 100.0 {
            LatencyClass::Excellent
        } else if latency_ms < 300.0 {
            LatencyClass::Good
        } else {
            LatencyClass::Slow
        }
    }
}

impl fmt::Display for LatencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyClass::Excellent => write!(f, "excellent"),
            LatencyClass::Good => write!(f, "good"),
            LatencyClass::Slow => write!(f, "slow"),
        }
    }
}

/// Current state of a key as shown in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Working,
    Down,
    Untested,
}

impl KeyStatus {
    pub fn of(key: &ServerKey) -> Self {
        if key.is_online() {
            KeyStatus::Working
        } else if key.is_tested() {
            KeyStatus::Down
        } else {
            KeyStatus::Untested
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Working => write!(f, "working"),
            KeyStatus::Down => write!(f, "down"),
            KeyStatus::Untested => write!(f, "untested"),
        }
    }
}

/// Aggregate figures for a whole collection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionStats {
    pub total: usize,
    pub tested: usize,
    pub working: usize,
    pub mean_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    /// Sorted by count, most common first
    pub protocols: Vec<(Protocol, usize)>,
    pub countries: Vec<(String, usize)>,
    pub groups: Vec<(String, usize)>,
}

impl CollectionStats {
    pub fn collect(keys: &[ServerKey]) -> Self {
        let latencies: Vec<f64> = keys.iter().filter_map(|k| k.average_latency()).collect();
        let mean_latency = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        let mut protocols: BTreeMap<&str, (Protocol, usize)> = BTreeMap::new();
        let mut countries: BTreeMap<&str, usize> = BTreeMap::new();
        let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
        for key in keys {
            protocols.entry(key.protocol.as_str()).or_insert((key.protocol, 0)).1 += 1;
            if let Some(country) = key.country.as_deref() {
                *countries.entry(country).or_default() += 1;
            }
            *groups.entry(key.group.as_str()).or_default() += 1;
        }

        Self {
            total: keys.len(),
            tested: keys.iter().filter(|k| k.is_tested()).count(),
            working: keys.iter().filter(|k| k.is_online()).count(),
            mean_latency,
            min_latency: latencies.iter().copied().reduce(f64::min),
            max_latency: latencies.iter().copied().reduce(f64::max),
            protocols: by_count(protocols.into_values().collect()),
            countries: by_count(
                countries
                    .into_iter()
                    .map(|(c, n)| (c.to_string(), n))
                    .collect(),
            ),
            groups: by_count(groups.into_iter().map(|(g, n)| (g.to_string(), n)).collect()),
        }
    }

    pub fn unavailable(&self) -> usize {
        self.total - self.working
    }

    /// Share of `count` in the whole collection, as a percentage
    pub fn percent(&self, count: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 / self.total as f64 * 100.0
        }
    }
}

fn by_count<T>(mut entries: Vec<(T, usize)>) -> Vec<(T, usize)> {
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries
}

/// Order helper for callers that sort by average latency with gaps last
pub fn compare_latency(a: &ServerKey, b: &ServerKey) -> Ordering {
    match (a.average_latency(), b.average_latency()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::probe::{ProbeError, ProbeResult};
    use crate::server::record::DEFAULT_GROUP;
    use chrono::Duration;

    fn key(raw: &str) -> ServerKey {
        ServerKey::new(raw, DEFAULT_GROUP)
    }

    /// Feed successes then failures, in that order
    fn probed(raw: &str, latencies: &[f64], failures: u32) -> ServerKey {
        let mut k = key(raw);
        let now = Utc::now();
        for &l in latencies {
            k.record_probe(&ProbeResult::reachable(l), now);
        }
        for _ in 0..failures {
            k.record_probe(&ProbeResult::failed(ProbeError::Refused), now);
        }
        k
    }

    fn names<'a>(keys: &[&'a ServerKey]) -> Vec<&'a str> {
        keys.iter().map(|k| k.name.as_str()).collect()
    }

    #[test]
    fn test_fastest_excludes_untested() {
        let keys = vec![
            probed("ssh://u@a.test:22#slow", &[300.0], 0),
            key("ssh://u@b.test:22#never"),
            probed("ssh://u@c.test:22#fast", &[20.0], 0),
            probed("ssh://u@d.test:22#dead", &[], 2),
        ];
        assert_eq!(names(&fastest(&keys)), vec!["fast", "slow"]);
    }

    #[test]
    fn test_most_stable_order() {
        let keys = vec![
            probed("ssh://u@a.test:22#few", &[10.0, 10.0], 0),
            probed("ssh://u@b.test:22#full-slow", &[200.0, 200.0, 200.0], 0),
            probed("ssh://u@c.test:22#half", &[5.0, 5.0], 2),
            probed("ssh://u@d.test:22#full-fast", &[50.0, 50.0, 50.0], 0),
        ];
        assert_eq!(
            names(&most_stable(&keys)),
            vec!["full-fast", "full-slow", "half"]
        );
    }

    #[test]
    fn test_most_stable_latency_less_last_in_tier() {
        let keys = vec![
            probed("ssh://u@a.test:22#no-latency", &[], 3),
            probed("ssh://u@b.test:22#some-latency", &[900.0], 2),
            probed("ssh://u@c.test:22#zero-other", &[], 4),
        ];
        let ranked = most_stable(&keys);
        // 33% first, then both 0% keys in input order
        assert_eq!(
            names(&ranked),
            vec!["some-latency", "no-latency", "zero-other"]
        );
    }

    #[test]
    fn test_auto_best_score_and_ties() {
        let keys = vec![
            probed("ssh://u@a.test:22#first", &[99.0, 99.0, 99.0], 0),
            probed("ssh://u@b.test:22#second", &[99.0, 99.0, 99.0], 0),
            probed("ssh://u@c.test:22#untested-enough", &[1.0], 0),
        ];
        let best = auto_best(&keys).unwrap();
        assert_eq!(best.name, "first");
        assert_eq!(best_score(best), Some(1.0));
        assert!(best_score(&keys[2]).is_none());
    }

    #[test]
    fn test_auto_best_prefers_reliability_ratio() {
        let keys = vec![
            probed("ssh://u@a.test:22#fast-flaky", &[10.0], 3),
            probed("ssh://u@b.test:22#steady", &[40.0, 40.0, 40.0, 40.0], 0),
        ];
        // 25 / 11 < 100 / 41
        assert_eq!(auto_best(&keys).unwrap().name, "steady");
        assert!(auto_best(&[key("ssh://u@x.test:22")]).is_none());
    }

    #[test]
    fn test_worst_classification() {
        let healthy_slow = probed("ssh://u@a.test:22", &[600.0; 5], 0);
        assert_eq!(healthy_slow.total_tests, 5);
        assert!(!is_worst(&healthy_slow));

        let mut unstable = probed("ssh://u@b.test:22", &[], 4);
        unstable.record_probe(&ProbeResult::reachable(50.0), Utc::now());
        assert_eq!(unstable.total_tests, 5);
        assert_eq!(unstable.successful_tests, 1);
        assert!(unstable.is_online());
        assert!(is_worst(&unstable));

        let last_failed = probed("ssh://u@c.test:22", &[20.0; 9], 1);
        assert!(is_worst(&last_failed));

        let mut slow_flaky = probed("ssh://u@d.test:22", &[800.0, 800.0], 3);
        slow_flaky.record_probe(&ProbeResult::reachable(800.0), Utc::now());
        assert_eq!(slow_flaky.success_rate(), 50.0);
        assert!(!is_worst(&slow_flaky));
        slow_flaky.record_probe(&ProbeResult::failed(ProbeError::Refused), Utc::now());
        slow_flaky.record_probe(&ProbeResult::failed(ProbeError::Refused), Utc::now());
        slow_flaky.record_probe(&ProbeResult::reachable(800.0), Utc::now());
        // 4 of 9
        assert!(slow_flaky.success_rate() < 50.0);
        assert!(slow_flaky.success_rate() > 30.0);
        assert!(slow_flaky.is_online());
        assert!(is_worst(&slow_flaky));

        assert!(!is_worst(&key("ssh://u@e.test:22")));
    }

    #[test]
    fn test_worst_keys_filter() {
        let keys = vec![
            probed("ssh://u@a.test:22#ok", &[30.0], 0),
            probed("ssh://u@b.test:22#bad", &[], 1),
            key("ssh://u@c.test:22#fresh"),
        ];
        assert_eq!(names(&worst_keys(&keys)), vec!["bad"]);
    }

    #[test]
    fn test_longest_uptime() {
        let now = Utc::now();
        let mut older = key("ssh://u@a.test:22#older");
        older.record_probe(&ProbeResult::reachable(10.0), now - Duration::hours(3));
        let mut newer = key("ssh://u@b.test:22#newer");
        newer.record_probe(&ProbeResult::reachable(10.0), now - Duration::minutes(5));
        let down = probed("ssh://u@c.test:22#down", &[10.0], 1);

        let keys = vec![newer, down, older];
        assert_eq!(names(&longest_uptime(&keys, now)), vec!["older", "newer"]);
    }

    #[test]
    fn test_latency_class_and_status() {
        assert_eq!(LatencyClass::of(99.9), LatencyClass::Excellent);
        assert_eq!(LatencyClass::of(100.0), LatencyClass::Good);
        assert_eq!(LatencyClass::of(300.0), LatencyClass::Slow);

        assert_eq!(KeyStatus::of(&key("ssh://u@a.test:22")), KeyStatus::Untested);
        assert_eq!(KeyStatus::of(&probed("ssh://u@a.test:22", &[1.0], 0)), KeyStatus::Working);
        assert_eq!(KeyStatus::of(&probed("ssh://u@a.test:22", &[], 1)), KeyStatus::Down);
        assert_eq!(KeyStatus::Down.to_string(), "down");
    }

    #[test]
    fn test_collection_stats() {
        let mut de = probed("vless://id@a.test:443#a", &[100.0], 0);
        de.country = Some("Germany".to_string());
        let mut de2 = probed("vless://id@b.test:443?security=reality#b", &[300.0], 0);
        de2.country = Some("Germany".to_string());
        let mut sub = key("trojan://pw@c.test:443#c");
        sub.group = "Sub:free".to_string();
        let down = probed("vless://id@d.test:443#d", &[], 1);

        let stats = CollectionStats::collect(&[de, de2, sub, down]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.tested, 3);
        assert_eq!(stats.working, 2);
        assert_eq!(stats.unavailable(), 2);
        assert_eq!(stats.mean_latency, Some(200.0));
        assert_eq!(stats.min_latency, Some(100.0));
        assert_eq!(stats.max_latency, Some(300.0));
        assert_eq!(stats.protocols[0], (Protocol::Vless, 2));
        assert_eq!(stats.protocols.len(), 3);
        assert_eq!(stats.countries, vec![("Germany".to_string(), 2)]);
        assert_eq!(stats.groups[0], (DEFAULT_GROUP.to_string(), 3));
        assert_eq!(stats.percent(2), 50.0);

        let empty = CollectionStats::collect(&[]);
        assert!(empty.mean_latency.is_none());
        assert_eq!(empty.percent(0), 0.0);
    }

    #[test]
    fn test_compare_latency_gaps_last() {
        let mut keys = vec![
            key("ssh://u@a.test:22#none"),
            probed("ssh://u@b.test:22#slow", &[90.0], 0),
            probed("ssh://u@c.test:22#fast", &[9.0], 0),
        ];
        keys.sort_by(compare_latency);
        let order: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(order, vec!["fast", "slow", "none"]);
    }

    #[test]
    fn test_best_keys_by_category() {
        let keys: Vec<ServerKey> = (1..=7)
            .map(|i| {
                probed(
                    &format!("ssh://u@h{}.test:22#k{}", i, i),
                    &[f64::from(i) * 10.0; 3],
                    if i == 2 { 1 } else { 0 },
                )
            })
            .collect();

        let fast = best_keys(&keys, BestCategory::Fastest, BEST_KEYS_COUNT);
        assert_eq!(names(&fast), vec!["k1", "k2", "k3", "k4", "k5"]);

        // k2 has a failure so it drops out of the perfect-rate block
        let stable = best_keys(&keys, BestCategory::Stable, BEST_KEYS_COUNT);
        assert_eq!(names(&stable), vec!["k1", "k3", "k4", "k5", "k6"]);

        assert!(best_keys(&keys[..0], BestCategory::Fastest, 5).is_empty());
        assert_eq!("Stable".parse::<BestCategory>().unwrap(), BestCategory::Stable);
        assert!("slowest".parse::<BestCategory>().is_err());
    }
}
