//! Engine configuration.
//!
//! Every knob has a default; [`CacheConfig::from_env`] overrides them from
//! `LARDER_*` environment variables and the CLI layers its flags on top.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use larder_core::{KIND_REPOST, KIND_TEXT_NOTE};

use crate::relay::url::{NormalizeResult, normalize_relay_url};
use crate::{Error, Result};

/// Relays used when none are configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://relay.nostr.band",
];

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable store limits and TTLs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// TTL for unprotected events, measured from `stored_at`.
    pub event_ttl: Duration,
    /// TTL for home-timeline events.
    pub protected_event_ttl: Duration,
    /// Hard expiry for cached profiles.
    pub profile_ttl: Duration,
    /// Age after which a profile is still served but flagged for refetch.
    pub profile_stale_after: Duration,
    pub event_soft_limit: usize,
    pub event_prune_target: usize,
    pub profile_soft_limit: usize,
    pub profile_prune_target: usize,
    pub timeline_soft_limit: usize,
    pub timeline_prune_target: usize,
    /// Maximum event ids kept in one timeline index.
    pub max_timeline_ids: usize,
    /// Estimated bytes per event row, for stats.
    pub event_row_bytes: u64,
    /// Estimated bytes per profile row, for stats.
    pub profile_row_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_ttl: DAY * 14,
            protected_event_ttl: DAY * 30,
            profile_ttl: DAY * 7,
            profile_stale_after: DAY,
            event_soft_limit: 5_000,
            event_prune_target: 3_000,
            profile_soft_limit: 2_000,
            profile_prune_target: 1_500,
            timeline_soft_limit: 50,
            timeline_prune_target: 30,
            max_timeline_ids: 1_000,
            event_row_bytes: 1_024,
            profile_row_bytes: 512,
        }
    }
}

/// Batching for the write coalescers.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Queue length that forces an immediate flush.
    pub batch_size: usize,
    /// Debounce delay before a partial batch is flushed.
    pub delay: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay: Duration::from_millis(500),
        }
    }
}

/// Timeline load sessions.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// `limit` sent to relays and read from cache per page.
    pub page_limit: usize,
    /// Event kinds requested for timelines.
    pub kinds: Vec<u16>,
    /// Debounce before buffered events are rendered.
    pub flush_debounce: Duration,
    /// Upper bound on a whole load session.
    pub safety_timeout: Duration,
    /// Upper bound on a single relay subscription.
    pub relay_timeout: Duration,
    /// Cached home/user timelines whose newest event is older than this are
    /// not rendered as a provisional view.
    pub staleness_ceiling: Duration,
    /// Interval of the background "new posts" check.
    pub sync_interval: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            page_limit: 50,
            kinds: vec![KIND_TEXT_NOTE, KIND_REPOST],
            flush_debounce: Duration::from_millis(300),
            safety_timeout: Duration::from_secs(8),
            relay_timeout: Duration::from_secs(5),
            staleness_ceiling: Duration::from_secs(30 * 60),
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Profile resolution.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// TTL of the in-memory tier, for hits and misses alike.
    pub hot_ttl: Duration,
    pub hot_capacity: u64,
    /// Minimum interval between network attempts for one author.
    pub retry_backoff: Duration,
    /// Upper bound on one relay's profile lookup.
    pub relay_timeout: Duration,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            hot_ttl: Duration::from_secs(5 * 60),
            hot_capacity: 10_000,
            retry_backoff: Duration::from_secs(30),
            relay_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Settings file. Defaults to `settings.json` next to the database.
    pub settings_path: Option<PathBuf>,
    /// Normalized relay URLs.
    pub relays: Vec<String>,
    /// Drop relay events whose id or signature does not verify.
    pub verify_events: bool,
    pub store: StoreConfig,
    pub coalescer: CoalescerConfig,
    pub loader: LoaderConfig,
    pub profile: ProfileConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/larder.db"),
            settings_path: None,
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            verify_events: true,
            store: StoreConfig::default(),
            coalescer: CoalescerConfig::default(),
            loader: LoaderConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `LARDER_DB_PATH`: SQLite file (default: "./data/larder.db")
    /// - `LARDER_SETTINGS_PATH`: settings JSON (default: next to the database)
    /// - `LARDER_RELAYS`: comma-separated relay URLs
    /// - `LARDER_EVENT_TTL_DAYS`, `LARDER_PROTECTED_TTL_DAYS`
    /// - `LARDER_EVENT_SOFT_LIMIT`, `LARDER_EVENT_PRUNE_TARGET`
    /// - `LARDER_BATCH_SIZE`, `LARDER_BATCH_DELAY_MS`
    /// - `LARDER_SAFETY_TIMEOUT_SECS`, `LARDER_RELAY_TIMEOUT_SECS`
    /// - `LARDER_SYNC_INTERVAL_SECS`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable numbers or relay URLs.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("LARDER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LARDER_SETTINGS_PATH") {
            config.settings_path = Some(PathBuf::from(path));
        }
        if let Ok(relays) = std::env::var("LARDER_RELAYS") {
            config.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(days) = env_parse::<u64>("LARDER_EVENT_TTL_DAYS")? {
            config.store.event_ttl = DAY * days as u32;
        }
        if let Some(days) = env_parse::<u64>("LARDER_PROTECTED_TTL_DAYS")? {
            config.store.protected_event_ttl = DAY * days as u32;
        }
        if let Some(n) = env_parse("LARDER_EVENT_SOFT_LIMIT")? {
            config.store.event_soft_limit = n;
        }
        if let Some(n) = env_parse("LARDER_EVENT_PRUNE_TARGET")? {
            config.store.event_prune_target = n;
        }
        if let Some(n) = env_parse("LARDER_BATCH_SIZE")? {
            config.coalescer.batch_size = n;
        }
        if let Some(ms) = env_parse("LARDER_BATCH_DELAY_MS")? {
            config.coalescer.delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("LARDER_SAFETY_TIMEOUT_SECS")? {
            config.loader.safety_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("LARDER_RELAY_TIMEOUT_SECS")? {
            config.loader.relay_timeout = Duration::from_secs(secs);
            config.profile.relay_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("LARDER_SYNC_INTERVAL_SECS")? {
            config.loader.sync_interval = Duration::from_secs(secs);
        }

        config.relays = normalize_relays(&config.relays)?;
        config.validate()?;

        tracing::info!(
            db_path = %config.db_path.display(),
            relays = config.relays.len(),
            event_soft_limit = config.store.event_soft_limit,
            event_prune_target = config.store.event_prune_target,
            batch_size = config.coalescer.batch_size,
            "cache configuration loaded"
        );

        Ok(config)
    }

    /// Where the settings file lives.
    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| self.db_path.with_file_name("settings.json"))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.store.event_prune_target > self.store.event_soft_limit {
            return Err(Error::Config(format!(
                "event prune target {} exceeds soft limit {}",
                self.store.event_prune_target, self.store.event_soft_limit
            )));
        }
        if self.coalescer.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if self.loader.page_limit == 0 {
            return Err(Error::Config("page limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Normalize and de-duplicate relay URLs, preserving order.
pub fn normalize_relays(urls: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        match normalize_relay_url(url) {
            NormalizeResult::Ok(normalized) => {
                if !out.contains(&normalized) {
                    out.push(normalized);
                }
            }
            NormalizeResult::Invalid(reason) => {
                return Err(Error::Config(format!(
                    "Invalid relay URL '{}': {}",
                    url, reason
                )));
            }
        }
    }
    Ok(out)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
