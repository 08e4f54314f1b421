use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use keyprobe::{
    database::KeyStore,
    logging,
    server::{
        batch::{BatchItem, BatchProgress, BatchReporter, BatchRunner, SilentReporter},
        collection::save_keys,
        ranking::{self, BEST_KEYS_COUNT},
    },
    tui::BatchMonitor,
    BestCategory, CollectionStats, Config, Endpoint, KeyDetails, KeyFilter, KeyList, KeyParser,
    KeyStatus, ProbeMode, Prober, Protocol, Rankings, ResultLine, ServerKey, StatsReport,
    SubscriptionConfig, SubscriptionManager, DATABASE_ENV, DEFAULT_DATABASE, DEFAULT_GROUP,
};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A proxy key parser and reachability tester
#[derive(Parser)]
#[command(name = "keyprobe")]
#[command(about = "A proxy key parser and reachability tester with concurrent probing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file path
    #[arg(short, long, env = DATABASE_ENV, default_value = DEFAULT_DATABASE)]
    database: String,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Import keys from a file (or stdin) into the database
    Import {
        /// Input file with one descriptor per line; reads stdin when omitted
        input: Option<PathBuf>,
        /// Group label for the imported keys
        #[arg(short, long, default_value = DEFAULT_GROUP)]
        group: String,
    },
    /// List stored keys
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Order by average latency, untested keys last
        #[arg(long)]
        by_latency: bool,
    },
    /// Parse a single descriptor and print its fields
    Parse {
        /// Descriptor string
        descriptor: String,
    },
    /// Show everything known about a stored key, probing it first if asked
    Show {
        /// Key ID
        id: String,
        /// Number of probes to run before printing
        #[arg(short, long, default_value = "0")]
        rounds: u32,
        /// Probe mode (latency, full, speed)
        #[arg(short, long, default_value = "full")]
        mode: String,
        /// Connect timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Probe stored keys and print rankings
    Test {
        /// Key IDs to probe; all keys matching the filters when omitted
        ids: Vec<String>,
        #[command(flatten)]
        filter: FilterArgs,
        /// Probe mode (latency, full, speed)
        #[arg(short, long, default_value = "latency")]
        mode: String,
        /// Number of concurrent probes
        #[arg(short = 'n', long, default_value = "10")]
        concurrency: usize,
        /// Connect timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Number of probe rounds
        #[arg(short, long, default_value = "1")]
        rounds: u32,
        /// Pause between rounds in seconds
        #[arg(long, default_value = "30")]
        interval: u64,
        /// Number of keys shown per ranking
        #[arg(long, default_value = "10")]
        top: usize,
        /// Show a live progress view
        #[arg(long)]
        tui: bool,
        /// Log file used while the progress view is active
        #[arg(long, default_value = "keyprobe.log")]
        log_file: PathBuf,
        /// Remove keys that are down after probing
        #[arg(long)]
        remove_dead: bool,
        /// Remove the worst performing keys after probing
        #[arg(long)]
        remove_worst: bool,
        /// Export the best keys of a ranking (fastest, stable) after probing
        #[arg(long)]
        best: Option<String>,
        /// Number of best keys to export
        #[arg(long, default_value_t = BEST_KEYS_COUNT)]
        best_count: usize,
        /// File for the best keys; prints to stdout when omitted
        #[arg(long)]
        best_output: Option<PathBuf>,
    },
    /// Export stored keys, one descriptor per line
    Export {
        #[command(flatten)]
        filter: FilterArgs,
        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove duplicate descriptors from a file
    Dedup {
        /// Input file with one descriptor per line
        input: PathBuf,
        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove keys by ID
    Remove {
        /// Key IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Toggle the favorite flag of a key
    Favorite {
        /// Key ID
        id: String,
    },
    /// Rename a key
    Rename {
        /// Key ID
        id: String,
        /// New display name
        name: String,
    },
    /// Attach a note to a key
    Note {
        /// Key ID
        id: String,
        /// Note text; an empty string clears it
        note: String,
    },
    /// Show collection statistics
    Stats {
        /// Probe all keys once before computing statistics
        #[arg(long)]
        probe: bool,
        /// Probe mode (latency, full, speed); full also resolves countries
        #[arg(short, long, default_value = "full")]
        mode: String,
        /// Connect timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Also write the report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage subscriptions
    Subscription {
        #[command(subcommand)]
        action: SubscriptionCommand,
    },
}

#[derive(Subcommand)]
enum SubscriptionCommand {
    /// Register a subscription URL
    Add {
        /// Subscription name
        name: String,
        /// Subscription URL
        url: String,
    },
    /// List subscriptions
    List,
    /// Remove a subscription and optionally its keys
    Remove {
        /// Subscription ID
        id: String,
        /// Also remove keys imported from it
        #[arg(long)]
        keys: bool,
    },
    /// Fetch subscriptions and import new keys
    Update {
        /// Subscription ID; all enabled subscriptions when omitted
        id: Option<String>,
        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Enable or disable a subscription
    Toggle {
        /// Subscription ID
        id: String,
    },
}

#[derive(clap::Args, Default)]
struct FilterArgs {
    /// Protocol (vmess, vless, vless-reality, trojan, shadowsocks, shadowsocks-2022, hysteria2, tuic, ssh)
    #[arg(short, long)]
    protocol: Option<String>,
    /// Group label
    #[arg(short, long)]
    group: Option<String>,
    /// Search in name, host and country
    #[arg(short, long)]
    search: Option<String>,
    /// Status (working, down, untested)
    #[arg(long)]
    status: Option<String>,
    /// Only favorites
    #[arg(short, long)]
    favorites: bool,
}

impl FilterArgs {
    fn to_filter(&self) -> Result<KeyFilter> {
        let mut filter = KeyFilter::new();
        if let Some(protocol) = &self.protocol {
            filter = filter.with_protocol(parse_protocol(protocol)?);
        }
        if let Some(group) = &self.group {
            filter = filter.with_group(group.clone());
        }
        if let Some(search) = &self.search {
            filter = filter.with_search(search.clone());
        }
        if let Some(status) = &self.status {
            filter = filter.with_status(parse_status(status)?);
        }
        if self.favorites {
            filter = filter.favorites_only();
        }
        Ok(filter)
    }
}

/// Prints each finished probe as a line
struct ConsoleReporter;

impl BatchReporter for ConsoleReporter {
    fn on_progress(&self, progress: &BatchProgress) {
        tracing::debug!(index = progress.index, total = progress.total, name = %progress.name, "dispatched");
    }

    fn on_result(&self, item: &BatchItem) {
        println!("  {}", ResultLine(item));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Test {
            tui: true,
            log_file,
            ..
        } => Some(log_file.clone()),
        _ => None,
    };
    logging::init(&cli.log_level, log_file.as_deref())?;

    let config = Config::new().with_database_url(cli.database.clone());
    let store = KeyStore::open(&config.database_url).await?;

    match cli.command {
        Commands::Import { input, group } => {
            let content = match &input {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut content = String::new();
                    std::io::stdin().read_to_string(&mut content)?;
                    content
                }
            };

            let mut list = KeyList::from_keys(store.load_keys().await?);
            let report = list.import(&content, &group);
            store.save_keys(list.keys()).await?;

            println!(
                "Imported into '{}': {} added, {} duplicates, {} parse errors, {} rejected lines",
                group, report.added, report.duplicates, report.parse_errors, report.rejected
            );
            println!("Total keys: {}", list.len());
        }
        Commands::List { filter, by_latency } => {
            let list = KeyList::from_keys(store.load_keys().await?);
            let mut keys = list.filter(&filter.to_filter()?);
            if by_latency {
                keys.sort_by(|a, b| ranking::compare_latency(a, b));
            }

            if keys.is_empty() {
                println!("No keys found.");
            } else {
                for key in keys {
                    print_key(key);
                }
            }
        }
        Commands::Parse { descriptor } => {
            if !KeyParser::is_supported(&descriptor) {
                return Err(anyhow!("Unsupported descriptor: {}", descriptor));
            }
            let key = ServerKey::new(&descriptor, DEFAULT_GROUP);
            println!("{}", KeyDetails::new(&key, Utc::now()));
        }
        Commands::Show {
            id,
            rounds,
            mode,
            timeout,
        } => {
            let mode: ProbeMode = mode.parse()?;
            let mut list = KeyList::from_keys(store.load_keys().await?);
            let key = list
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Key not found: {}", id))?;

            if rounds > 0 {
                let prober = Prober::with_config(
                    config.probe.clone().with_timeout(Duration::from_secs(timeout)),
                )?;
                for _ in 0..rounds {
                    prober.probe(key, mode).await;
                }
            }
            println!("{}", KeyDetails::new(key, Utc::now()));
        }
        Commands::Test {
            ids,
            filter,
            mode,
            concurrency,
            timeout,
            rounds,
            interval,
            top,
            tui,
            log_file: _,
            remove_dead,
            remove_worst,
            best,
            best_count,
            best_output,
        } => {
            let mode: ProbeMode = mode.parse()?;
            let best: Option<BestCategory> = best.as_deref().map(str::parse::<BestCategory>).transpose()?;
            let probe_config = config
                .probe
                .clone()
                .with_concurrency(concurrency)
                .with_timeout(Duration::from_secs(timeout));
            let prober = Prober::with_config(probe_config)?;

            let mut list = KeyList::from_keys(store.load_keys().await?);
            let key_filter = filter.to_filter()?;
            let mut selected: Vec<ServerKey> = list
                .iter()
                .filter(|k| ids.is_empty() || ids.contains(&k.id))
                .filter(|k| key_filter.matches(k))
                .cloned()
                .collect();

            if selected.is_empty() {
                println!("No keys to test.");
                return Ok(());
            }

            println!(
                "Testing {} keys | mode: {} | concurrency: {} | timeout: {}s",
                selected.len(),
                mode,
                concurrency,
                timeout
            );

            let cancel = CancellationToken::new();
            if !tui {
                let token = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.cancel();
                    }
                });
            }

            for round in 1..=rounds.max(1) {
                if rounds > 1 {
                    println!("\nRound {}/{}", round, rounds);
                }

                let summary = if tui {
                    BatchMonitor::run(&mut selected, &prober, mode).await?
                } else {
                    BatchRunner::new(&prober)
                        .run(&mut selected, mode, &cancel, &ConsoleReporter)
                        .await
                };

                println!(
                    "Round {} finished: {} probed | {} working | {} failed{}",
                    round,
                    summary,
                    summary.succeeded,
                    summary.failed,
                    if summary.cancelled { " | cancelled" } else { "" }
                );

                if summary.cancelled || cancel.is_cancelled() {
                    break;
                }
                if round < rounds {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }

            let now = Utc::now();
            println!("\n{}", Rankings::new(&selected, top, now));
            println!("{}", StatsReport::new(&CollectionStats::collect(&selected), now));

            if let Some(category) = best {
                let best_keys = ranking::best_keys(&selected, category, best_count);
                if best_keys.is_empty() {
                    println!("No keys ranked as {:?}", category);
                } else if let Some(path) = &best_output {
                    save_keys(best_keys.iter().copied(), path)?;
                    println!("Exported {} best keys to {:?}", best_keys.len(), path);
                } else {
                    for key in best_keys {
                        println!("{}", key.share_link());
                    }
                }
            }

            // Copy probe results into the stored list before pruning
            for probed in &selected {
                if let Some(key) = list.get_mut(&probed.id) {
                    *key = probed.clone();
                }
            }

            let mut removed = 0;
            if remove_dead {
                removed += list.remove_dead();
            }
            if remove_worst {
                removed += list.remove_worst();
            }
            if removed > 0 {
                store.save_keys(list.keys()).await?;
                println!("\nRemoved {} keys, {} remaining", removed, list.len());
            }
        }
        Commands::Export { filter, output } => {
            let list = KeyList::from_keys(store.load_keys().await?);
            let keys = list.filter(&filter.to_filter()?);

            if let Some(output_path) = output {
                save_keys(keys.iter().copied(), &output_path)?;
                println!("Exported {} keys to {:?}", keys.len(), output_path);
            } else {
                for key in keys {
                    println!("{}", key.share_link());
                }
            }
        }
        Commands::Dedup { input, output } => {
            let content = std::fs::read_to_string(&input)?;
            let keys: Vec<ServerKey> = content
                .lines()
                .map(str::trim)
                .filter(|line| KeyParser::is_supported(line))
                .map(|line| ServerKey::new(line, DEFAULT_GROUP))
                .collect();

            let mut list = KeyList::from_keys(keys);
            let removed = list.remove_duplicates();
            eprintln!("Removed {} duplicates, {} unique keys", removed, list.len());

            if let Some(output_path) = output {
                list.save_to_file(&output_path)?;
                println!("Saved unique keys to {:?}", output_path);
            } else {
                println!("{}", list.export_string());
            }
        }
        Commands::Remove { ids } => {
            let mut list = KeyList::from_keys(store.load_keys().await?);
            for id in &ids {
                match list.remove(id) {
                    Some(key) => println!("Key removed: {} ({})", key.name, key.id),
                    None => eprintln!("Key not found: {}", id),
                }
            }
            store.save_keys(list.keys()).await?;
        }
        Commands::Favorite { id } => {
            let mut list = KeyList::from_keys(store.load_keys().await?);
            match list.toggle_favorite(&id) {
                Some(true) => println!("Added to favorites: {}", id),
                Some(false) => println!("Removed from favorites: {}", id),
                None => return Err(anyhow!("Key not found: {}", id)),
            }
            store.save_keys(list.keys()).await?;
        }
        Commands::Rename { id, name } => {
            let mut list = KeyList::from_keys(store.load_keys().await?);
            if !list.rename(&id, &name) {
                return Err(anyhow!("Key not found: {}", id));
            }
            store.save_keys(list.keys()).await?;
            println!("Key renamed: {} -> {}", id, name);
        }
        Commands::Note { id, note } => {
            let mut list = KeyList::from_keys(store.load_keys().await?);
            if !list.set_note(&id, &note) {
                return Err(anyhow!("Key not found: {}", id));
            }
            store.save_keys(list.keys()).await?;
            println!("Note saved for {}", id);
        }
        Commands::Stats {
            probe,
            mode,
            timeout,
            output,
        } => {
            let mode: ProbeMode = mode.parse()?;
            let mut list = KeyList::from_keys(store.load_keys().await?);
            if probe && !list.is_empty() {
                let prober = Prober::with_config(
                    config.probe.clone().with_timeout(Duration::from_secs(timeout)),
                )?;
                BatchRunner::new(&prober)
                    .run(
                        list.keys_mut(),
                        mode,
                        &CancellationToken::new(),
                        &SilentReporter,
                    )
                    .await;
            }

            let report = StatsReport::new(&list.stats(), Utc::now()).to_string();
            print!("{}", report);
            if let Some(path) = output {
                std::fs::write(&path, &report)?;
                println!("\nStatistics saved to {:?}", path);
            }
        }
        Commands::Subscription { action } => {
            let subscriptions = store.load_subscriptions().await?;
            let subscription_config = match &action {
                SubscriptionCommand::Update { timeout, .. } => {
                    SubscriptionConfig::new().with_timeout(Duration::from_secs(*timeout))
                }
                _ => config.subscription.clone(),
            };
            let mut manager =
                SubscriptionManager::with_config(subscription_config)?.with_subscriptions(subscriptions);

            match action {
                SubscriptionCommand::Add { name, url } => {
                    let sub = manager.add(&name, &url)?;
                    println!("Subscription added: {} ({})", sub.name, sub.id);
                }
                SubscriptionCommand::List => {
                    if manager.subscriptions().is_empty() {
                        println!("No subscriptions found.");
                    }
                    for sub in manager.subscriptions() {
                        let status = if sub.enabled { "✓" } else { "○" };
                        let updated = sub
                            .last_update
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "never".to_string());
                        println!("{} {} - {} ({})", status, sub.name, sub.id, sub.url);
                        println!("   {} servers, last update: {}", sub.server_count, updated);
                    }
                }
                SubscriptionCommand::Remove { id, keys } => {
                    let sub = manager
                        .remove(&id)
                        .ok_or_else(|| anyhow!("Subscription not found: {}", id))?;
                    println!("Subscription removed: {}", sub.name);
                    if keys {
                        let mut list = KeyList::from_keys(store.load_keys().await?);
                        let removed = list.remove_group(&sub.group());
                        store.save_keys(list.keys()).await?;
                        println!("Removed {} keys from {}", removed, sub.group());
                    }
                }
                SubscriptionCommand::Update { id, .. } => {
                    let results = match id {
                        Some(id) => vec![manager.update(&id).await],
                        None => manager.update_all().await,
                    };
                    if results.is_empty() {
                        println!("No enabled subscriptions to update.");
                    }

                    let mut list = KeyList::from_keys(store.load_keys().await?);
                    for result in &results {
                        if result.is_success() {
                            let report = result.import_into(&mut list);
                            println!(
                                "{}: {} keys, {} new, {} duplicates",
                                result.source,
                                result.keys.len(),
                                report.added,
                                report.duplicates
                            );
                        } else if let Some(error) = &result.error {
                            eprintln!("Error updating {}: {}", result.source, error);
                        }
                    }
                    store.save_keys(list.keys()).await?;
                }
                SubscriptionCommand::Toggle { id } => {
                    let enabled = manager
                        .get(&id)
                        .map(|s| !s.enabled)
                        .ok_or_else(|| anyhow!("Subscription not found: {}", id))?;
                    manager.set_enabled(&id, enabled);
                    println!(
                        "Subscription {} {}",
                        id,
                        if enabled { "enabled" } else { "disabled" }
                    );
                }
            }

            store.save_subscriptions(manager.subscriptions()).await?;
        }
    }

    store.close().await;
    Ok(())
}

fn parse_protocol(s: &str) -> Result<Protocol> {
    match s.parse::<Protocol>() {
        Ok(Protocol::Unknown) | Err(_) => Err(anyhow!(
            "Invalid protocol: {}. Use: vmess, vless, vless-reality, trojan, shadowsocks, shadowsocks-2022, hysteria2, tuic, ssh",
            s
        )),
        Ok(protocol) => Ok(protocol),
    }
}

fn parse_status(s: &str) -> Result<KeyStatus> {
    match s.to_lowercase().as_str() {
        "working" | "online" => Ok(KeyStatus::Working),
        "down" | "offline" => Ok(KeyStatus::Down),
        "untested" => Ok(KeyStatus::Untested),
        _ => Err(anyhow!(
            "Invalid status: {}. Use: working, down, untested",
            s
        )),
    }
}

fn print_key(key: &ServerKey) {
    let status = match KeyStatus::of(key) {
        KeyStatus::Working => "✓",
        KeyStatus::Down => "✗",
        KeyStatus::Untested => "○",
    };
    println!(
        "{} {} [{}] {} - {}",
        status,
        key.id,
        key.protocol.label(),
        key.display_name(),
        key.group
    );
    match key.config.error() {
        Some(error) => println!("   error: {}", error),
        None => println!("   {}", key.config.address()),
    }
    if !key.notes.is_empty() {
        println!("   note: {}", key.notes);
    }
}
