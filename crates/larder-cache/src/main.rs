//! `larder`: command-line front end for the timeline cache.
//!
//! # Usage
//!
//! ```bash
//! # Load the global timeline, then two older pages
//! larder timeline --older 2
//!
//! # Someone's home timeline, kept fresh every 30 seconds
//! larder watch --home <pubkey> --interval 30
//!
//! # Resolve a profile without writing it to the cache
//! larder profile <pubkey> --no-persist
//!
//! # Cache administration
//! larder stats
//! larder settings --timeline-cache off
//! larder clear --yes
//! ```
//!
//! Configuration comes from `LARDER_*` environment variables (see
//! `CacheConfig::from_env`); flags given here override them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use larder_cache::config::normalize_relays;
use larder_cache::{
    CacheConfig, CacheContext, LoadOutcome, LoadReport, TimelineSink, TimelineView,
    WebSocketTransport, spawn_background_sync,
};
use larder_core::metrics::{init_metrics, start_metrics_server};
use larder_core::{Event, TimelineRef};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "larder")]
#[command(about = "Offline-first Nostr timeline cache")]
#[command(version)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Relay URLs (comma-separated, overrides LARDER_RELAYS)
    #[arg(long, global = true, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Serve Prometheus metrics on this port
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a timeline and print it
    Timeline {
        #[command(flatten)]
        target: Target,

        /// Older pages to load after the first
        #[arg(long, default_value = "0")]
        older: usize,
    },
    /// Load a timeline and keep checking for new posts until Ctrl+C
    Watch {
        #[command(flatten)]
        target: Target,

        /// Seconds between checks (defaults to LARDER_SYNC_INTERVAL_SECS)
        #[arg(long)]
        interval: Option<u64>,

        /// Render new posts as soon as they are found
        #[arg(long)]
        auto_show: bool,
    },
    /// Resolve an author's profile
    Profile {
        pubkey: String,

        /// Do not write a network result to the cache
        #[arg(long)]
        no_persist: bool,
    },
    /// Print cache statistics and relay health
    Stats,
    /// Show or change settings
    Settings {
        /// Turn the timeline cache on or off
        #[arg(long)]
        timeline_cache: Option<Toggle>,
    },
    /// Delete everything in the cache
    Clear {
        /// Required: confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

/// Which timeline to open. Defaults to global.
#[derive(Args, Debug)]
struct Target {
    /// Home timeline of this pubkey (their follows)
    #[arg(long, conflicts_with = "user")]
    home: Option<String>,

    /// Posts by this pubkey
    #[arg(long)]
    user: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

/// Prints whatever a view renders.
struct PrintSink;

impl PrintSink {
    fn print(tag: &str, events: &[Event]) {
        for event in events {
            let when = chrono::DateTime::from_timestamp(event.created_at as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| event.created_at.to_string());
            let first_line = event.content.lines().next().unwrap_or_default();
            println!(
                "{tag} {when} {} {}: {}",
                short(&event.id),
                short(&event.pubkey),
                first_line
            );
        }
    }
}

fn short(hex: &str) -> &str {
    hex.get(..8).unwrap_or(hex)
}

impl TimelineSink for PrintSink {
    fn render_cached(&self, events: &[Event]) {
        Self::print("[cache]", events);
    }

    fn render_events(&self, events: &[Event]) {
        Self::print("[relay]", events);
    }

    fn remove_events(&self, ids: &[String]) {
        for id in ids {
            println!("[deleted] {}", short(id));
        }
    }

    fn finished(&self, report: &LoadReport) {
        if let Some(message) = report.outcome.message() {
            println!("{message}");
        }
    }

    fn new_events_available(&self, count: usize) {
        if count > 0 {
            println!("{count} new posts");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("larder_cache=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Some(port) = cli.metrics_port {
        let handle = init_metrics();
        start_metrics_server(port, handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {port}"))?;
    }

    let config = build_config(&cli)?;
    let transport = Arc::new(WebSocketTransport::new(
        config.loader.relay_timeout,
        config.verify_events,
    ));
    let sync_interval = config.loader.sync_interval;
    let ctx = CacheContext::open(config, transport).context("Failed to open cache")?;

    let result = run(&ctx, cli.command, sync_interval).await;
    ctx.shutdown();
    result
}

fn build_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = CacheConfig::from_env()?;
    if let Some(path) = &cli.db_path {
        config.db_path = path.clone();
    }
    if let Some(relays) = &cli.relays {
        config.relays = normalize_relays(relays)?;
    }
    if config.relays.is_empty() {
        bail!("No relays configured");
    }
    Ok(config)
}

async fn run(ctx: &CacheContext, command: Command, sync_interval: Duration) -> Result<()> {
    match command {
        Command::Timeline { target, older } => {
            let view = open_target(ctx, &target).await;
            let report = view.load_initial().await;
            summarize(&report);

            for _ in 0..older {
                match view.load_older().await {
                    Some(report) => {
                        summarize(&report);
                        if report.outcome != LoadOutcome::Loaded {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        Command::Watch {
            target,
            interval,
            auto_show,
        } => {
            let interval = interval.map(Duration::from_secs).unwrap_or(sync_interval);
            let view = open_target(ctx, &target).await;
            summarize(&view.load_initial().await);

            let sync = spawn_background_sync(view.clone(), interval);
            tracing::info!("Watching {} every {:?}, Ctrl+C to stop", view.tref(), interval);

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        if auto_show {
                            view.show_pending();
                        }
                    }
                }
            }
            sync.abort();
        }

        Command::Profile { pubkey, no_persist } => {
            match ctx.profiles().resolve_with(&pubkey, !no_persist).await {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => println!("No profile found for {}", short(&pubkey)),
            }
        }

        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&ctx.stats())?);
            println!("{}", serde_json::to_string_pretty(&ctx.health().snapshot())?);
        }

        Command::Settings { timeline_cache } => {
            if let Some(toggle) = timeline_cache {
                ctx.set_timeline_cache_enabled(matches!(toggle, Toggle::On))
                    .context("Failed to save settings")?;
            }
            println!("{}", serde_json::to_string_pretty(&ctx.settings().current())?);
        }

        Command::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear the cache without --yes");
            }
            ctx.clear_all();
            println!("Cache cleared");
        }
    }
    Ok(())
}

async fn open_target(ctx: &CacheContext, target: &Target) -> Arc<TimelineView> {
    let sink = Arc::new(PrintSink);
    match (&target.home, &target.user) {
        (Some(owner), _) => ctx.open_home_view(owner, sink).await,
        (None, Some(author)) => {
            ctx.open_view(TimelineRef::user(author), Some(vec![author.clone()]), sink)
        }
        (None, None) => ctx.open_view(TimelineRef::global(), None, sink),
    }
}

fn summarize(report: &LoadReport) {
    tracing::info!(
        outcome = report.outcome.as_str(),
        rendered = report.rendered,
        from_cache = report.from_cache,
        relays_ok = report.relays_ok,
        relays_failed = report.relays_failed,
        "Page loaded"
    );
}
