//! Text reports for keys, batch results and collections

use crate::server::batch::BatchItem;
use crate::server::models::{Endpoint, ServerConfig};
use crate::server::ranking::{self, CollectionStats};
use crate::server::record::{ServerKey, AVERAGE_WINDOW};
use chrono::{DateTime, Utc};
use std::fmt;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Countries listed before the rest are summarized
const MAX_COUNTRIES: usize = 10;

fn latency(value: Option<f64>) -> String {
    value
        .map(|l| format!("{:.2} ms", l))
        .unwrap_or_else(|| "-".to_string())
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn geo(ip: Option<&str>, country: Option<&str>) -> String {
    match (ip, country) {
        (Some(ip), Some(country)) => format!("{} ({})", ip, country),
        (Some(ip), None) => ip.to_string(),
        (None, Some(country)) => country.to_string(),
        (None, None) => String::new(),
    }
}

/// One line per finished probe
pub struct ResultLine<'a>(pub &'a BatchItem);

impl fmt::Display for ResultLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let item = self.0;
        match item.result.latency_ms() {
            Some(latency_ms) => {
                write!(f, "✓ {} {} ({:.2} ms)", item.key_id, item.name, latency_ms)?;
                let geo = geo(item.result.ip.as_deref(), item.result.country.as_deref());
                if !geo.is_empty() {
                    write!(f, " {}", geo)?;
                }
                Ok(())
            }
            None => {
                write!(f, "✗ {} {}", item.key_id, item.name)?;
                if let Some(error) = item.result.error() {
                    write!(f, ": {}", error)?;
                }
                Ok(())
            }
        }
    }
}

/// Everything known about one key: config fields, probe statistics, geo and notes
pub struct KeyDetails<'a> {
    key: &'a ServerKey,
    now: DateTime<Utc>,
}

impl<'a> KeyDetails<'a> {
    pub fn new(key: &'a ServerKey, now: DateTime<Utc>) -> Self {
        Self { key, now }
    }

    fn config(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key.config {
            ServerConfig::Vmess(c) => {
                for (field, value) in &c.fields {
                    writeln!(f, "  {}: {}", field, value)?;
                }
            }
            ServerConfig::Vless(c) => {
                writeln!(f, "  network: {} | security: {}", c.network, c.security)?;
                if !c.public_key.is_empty() {
                    writeln!(f, "  pbk: {} | sid: {}", c.public_key, c.short_id)?;
                }
            }
            ServerConfig::Trojan(c) => {
                writeln!(f, "  network: {} | security: {}", c.network, c.security)?
            }
            ServerConfig::Shadowsocks(c) => writeln!(f, "  method: {}", c.method)?,
            ServerConfig::Hysteria2(c) => {
                writeln!(f, "  sni: {} | insecure: {}", c.sni, c.insecure)?
            }
            ServerConfig::Tuic(c) => writeln!(
                f,
                "  congestion: {} | alpn: {}",
                c.congestion_control, c.alpn
            )?,
            ServerConfig::Ssh(c) => writeln!(f, "  user: {}", c.user)?,
            ServerConfig::Invalid(c) => writeln!(f, "  error: {}", c.error)?,
        }
        Ok(())
    }
}

impl fmt::Display for KeyDetails<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key;
        let history = &key.latency_history;

        writeln!(f, "ID:        {}", key.id)?;
        writeln!(f, "Name:      {}", key.name)?;
        writeln!(f, "Protocol:  {} ({})", key.protocol.label(), key.protocol)?;
        writeln!(f, "Address:   {}", key.config.address())?;
        writeln!(f, "Group:     {}", key.group)?;
        writeln!(f, "Favorite:  {}", if key.is_favorite { "yes" } else { "no" })?;
        self.config(f)?;

        writeln!(f, "\nGeo:")?;
        writeln!(f, "  IP:      {}", key.ip_address.as_deref().unwrap_or("-"))?;
        writeln!(f, "  Country: {}", key.country.as_deref().unwrap_or("-"))?;

        writeln!(f, "\nTests:")?;
        writeln!(f, "  Total:   {}", key.total_tests)?;
        writeln!(f, "  Passed:  {}", key.successful_tests)?;
        writeln!(f, "  Failed:  {}", key.total_tests - key.successful_tests)?;
        writeln!(f, "  Success: {:.1}%", key.success_rate())?;

        writeln!(f, "\nLatency:")?;
        writeln!(f, "  Average: {}", latency(key.average_latency()))?;
        writeln!(f, "  Min:     {}", latency(history.min()))?;
        writeln!(f, "  Max:     {}", latency(history.max()))?;
        writeln!(f, "  Samples: {}", history.len())?;
        writeln!(f, "  Last {}:", AVERAGE_WINDOW)?;
        if history.is_empty() {
            writeln!(f, "    no data")?;
        }
        for (i, sample) in history.recent(AVERAGE_WINDOW).enumerate() {
            writeln!(f, "    {}. {:.2} ms", i + 1, sample)?;
        }

        let minutes = key.uptime_minutes(self.now);
        writeln!(f, "\nUptime:")?;
        writeln!(
            f,
            "  {} min ({:.2} h)",
            minutes,
            minutes as f64 / 60.0
        )?;
        writeln!(f, "  Online since: {}", timestamp(key.online_since))?;
        writeln!(f, "  Last test:    {}", timestamp(key.last_test_time))?;

        writeln!(f, "\nSpeed:")?;
        match key.download_speed {
            Some(speed) => writeln!(f, "  Download: {:.2} Mbps", speed)?,
            None => writeln!(f, "  Download: not tested")?,
        }
        match key.upload_speed {
            Some(speed) => writeln!(f, "  Upload:   {:.2} Mbps", speed)?,
            None => writeln!(f, "  Upload:   not tested")?,
        }

        writeln!(f, "\nNotes:")?;
        if key.notes.is_empty() {
            write!(f, "  -")
        } else {
            write!(f, "  {}", key.notes)
        }
    }
}

/// Fastest, most stable and longest running keys plus the overall pick
pub struct Rankings<'a> {
    keys: &'a [ServerKey],
    top: usize,
    now: DateTime<Utc>,
}

impl<'a> Rankings<'a> {
    pub fn new(keys: &'a [ServerKey], top: usize, now: DateTime<Utc>) -> Self {
        Self { keys, top, now }
    }
}

impl fmt::Display for Rankings<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fastest:")?;
        for (i, key) in ranking::fastest(self.keys).iter().take(self.top).enumerate() {
            write!(
                f,
                "{:>3}. {} [{}] {} | {}",
                i + 1,
                key.id,
                key.protocol.label(),
                key.display_name(),
                latency(key.average_latency())
            )?;
            if let Some(country) = &key.country {
                write!(f, " | {}", country)?;
            }
            writeln!(f)?;
        }

        let stable = ranking::most_stable(self.keys);
        if !stable.is_empty() {
            writeln!(f, "\nMost stable:")?;
            for (i, key) in stable.iter().take(self.top).enumerate() {
                writeln!(
                    f,
                    "{:>3}. {} {} | {:.0}% of {} | {}",
                    i + 1,
                    key.id,
                    key.display_name(),
                    key.success_rate(),
                    key.total_tests,
                    latency(key.average_latency())
                )?;
            }
        }

        let uptime = ranking::longest_uptime(self.keys, self.now);
        if !uptime.is_empty() {
            writeln!(f, "\nLongest uptime:")?;
            for (i, key) in uptime.iter().take(self.top).enumerate() {
                writeln!(
                    f,
                    "{:>3}. {} {} | {} min",
                    i + 1,
                    key.id,
                    key.display_name(),
                    key.uptime_minutes(self.now)
                )?;
            }
        }

        if let Some(best) = ranking::auto_best(self.keys) {
            writeln!(
                f,
                "\nBest server: {} {} | {} | {:.0}%",
                best.id,
                best.display_name(),
                latency(best.average_latency()),
                best.success_rate()
            )?;
            writeln!(f, "{}", best.share_link())?;
        }

        let worst = ranking::worst_keys(self.keys);
        if !worst.is_empty() {
            writeln!(f, "\n{} keys classified as worst", worst.len())?;
        }
        Ok(())
    }
}

/// Collection-wide statistics
pub struct StatsReport<'a> {
    stats: &'a CollectionStats,
    generated: DateTime<Utc>,
}

impl<'a> StatsReport<'a> {
    pub fn new(stats: &'a CollectionStats, generated: DateTime<Utc>) -> Self {
        Self { stats, generated }
    }
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats;

        writeln!(f, "Generated:   {}", self.generated.format(TIME_FORMAT))?;
        writeln!(f, "Keys:        {}", stats.total)?;
        writeln!(
            f,
            "Tested:      {} ({:.1}%)",
            stats.tested,
            stats.percent(stats.tested)
        )?;
        writeln!(
            f,
            "Working:     {} ({:.1}%)",
            stats.working,
            stats.percent(stats.working)
        )?;
        writeln!(f, "Unavailable: {}", stats.unavailable())?;

        if let (Some(mean), Some(min), Some(max)) =
            (stats.mean_latency, stats.min_latency, stats.max_latency)
        {
            writeln!(
                f,
                "Latency:     mean {:.0} ms, min {:.0} ms, max {:.0} ms",
                mean, min, max
            )?;
        }

        writeln!(f, "\nProtocols:")?;
        for (protocol, count) in &stats.protocols {
            writeln!(
                f,
                "  {}: {} ({:.1}%)",
                protocol.label(),
                count,
                stats.percent(*count)
            )?;
        }

        if !stats.countries.is_empty() {
            writeln!(f, "\nCountries:")?;
            for (country, count) in stats.countries.iter().take(MAX_COUNTRIES) {
                writeln!(f, "  {}: {} ({:.1}%)", country, count, stats.percent(*count))?;
            }
            if stats.countries.len() > MAX_COUNTRIES {
                writeln!(f, "  ... and {} more", stats.countries.len() - MAX_COUNTRIES)?;
            }
        }

        writeln!(f, "\nGroups:")?;
        for (group, count) in &stats.groups {
            writeln!(f, "  {}: {}", group, count)?;
        }
        Ok(())
    }
}
