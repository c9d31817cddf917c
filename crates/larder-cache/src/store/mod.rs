//! Durable store: events, profiles, timeline indexes and metadata in SQLite.
//!
//! Every logical operation runs in its own `IMMEDIATE` transaction, so a
//! batch is either fully visible or not at all, and concurrent writers
//! (other processes on the same file) serialize on SQLite's write lock.
//!
//! The store never returns errors. If the database cannot be opened, or an
//! operation fails, the failure is logged and the caller gets an empty
//! result. The rest of the engine keeps working without persistence.
//!
//! Timeline operations additionally check the live
//! [`TimelineCacheFlag`](crate::settings::TimelineCacheFlag) first; with the
//! flag off they report "no cache" and write nothing.

mod eviction;
mod events;
mod metadata;
mod profiles;
pub mod schema;
mod stats;
mod timelines;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::Result;
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::settings::TimelineCacheFlag;

pub use eviction::EvictionReport;
pub use events::{CachedEvent, EventQuery};
pub use profiles::CachedProfile;
pub use stats::{CacheStats, EventTableStats, ProfileTableStats, TimelineTableStats};
pub use timelines::{CachedTimeline, TimelineBatch, TimelineRecord};

/// SQLite-backed cache of events, profiles, timeline indexes and metadata.
pub struct CacheStore {
    /// `None` when the database could not be opened (degraded mode).
    conn: Option<Mutex<Connection>>,
    config: StoreConfig,
    timeline_flag: TimelineCacheFlag,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Open or create the store at `path`.
    ///
    /// Never fails: if the file cannot be opened the store starts in
    /// degraded mode and [`is_available`](Self::is_available) returns false.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        timeline_flag: TimelineCacheFlag,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let conn = match Self::open_connection(path) {
            Ok(conn) => {
                tracing::info!("Opened cache database at {}", path.display());
                Some(Mutex::new(conn))
            }
            Err(e) => {
                tracing::warn!(
                    "Cache database unavailable at {}, continuing without persistence: {}",
                    path.display(),
                    e
                );
                None
            }
        };

        Self {
            conn,
            config,
            timeline_flag,
            clock,
        }
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(
        config: StoreConfig,
        timeline_flag: TimelineCacheFlag,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let conn = Connection::open_in_memory()
            .map_err(crate::Error::from)
            .and_then(|conn| {
                schema::init_schema(&conn)?;
                Ok(conn)
            });

        let conn = match conn {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(e) => {
                tracing::warn!("In-memory cache database unavailable: {}", e);
                None
            }
        };

        Self {
            conn,
            config,
            timeline_flag,
            clock,
        }
    }

    /// A store with no backing database. Every read is empty and every
    /// write is a no-op.
    pub fn unavailable(
        config: StoreConfig,
        timeline_flag: TimelineCacheFlag,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn: None,
            config,
            timeline_flag,
            clock,
        }
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        schema::init_schema(&conn)?;

        Ok(conn)
    }

    /// Whether a database is backing this store.
    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn timeline_flag(&self) -> &TimelineCacheFlag {
        &self.timeline_flag
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Run `f` inside one `IMMEDIATE` transaction.
    ///
    /// Commits if `f` succeeds; rolls back and returns `T::default()` if
    /// anything fails or the store is unavailable.
    pub(crate) fn with_tx<T, F>(&self, op: &'static str, f: F) -> T
    where
        T: Default,
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let Some(conn) = &self.conn else {
            return T::default();
        };
        let mut conn = conn.lock();

        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            });

        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(op, "Cache operation failed: {}", e);
                metrics::counter!("cache_store_errors_total").increment(1);
                T::default()
            }
        }
    }

    /// Delete every row from every table.
    pub fn clear_all(&self) {
        let cleared = self.with_tx("clear_all", |tx| {
            tx.execute_batch(
                "DELETE FROM events; DELETE FROM profiles; DELETE FROM timelines; DELETE FROM metadata;",
            )?;
            Ok(true)
        });
        if cleared {
            tracing::info!("Cleared all cached data");
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("available", &self.is_available())
            .field("timeline_cache_enabled", &self.timeline_flag.is_enabled())
            .finish_non_exhaustive()
    }
}

pub(crate) fn ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
