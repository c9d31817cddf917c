//! SQLite schema for the durable store.
//!
//! Timestamps ending in `_at` that the store itself assigns (`stored_at`,
//! `last_accessed_at`, `updated_at`) are Unix milliseconds. Event
//! `created_at` and timeline bounds are the events' own Unix seconds.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Events, one row per id
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            pubkey TEXT NOT NULL,
            kind INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            stored_at INTEGER NOT NULL,
            is_protected INTEGER NOT NULL DEFAULT 0,
            json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
        CREATE INDEX IF NOT EXISTS idx_events_pubkey_created ON events(pubkey, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_events_stored ON events(stored_at);
        CREATE INDEX IF NOT EXISTS idx_events_protected ON events(is_protected);

        -- Author profiles, newest write wins
        CREATE TABLE IF NOT EXISTS profiles (
            pubkey TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            stored_at INTEGER NOT NULL,
            last_accessed_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_profiles_accessed ON profiles(last_accessed_at);

        -- Ordered event-id index per timeline
        CREATE TABLE IF NOT EXISTS timelines (
            key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            owner TEXT,
            event_ids TEXT NOT NULL,
            newest_timestamp INTEGER,
            oldest_timestamp INTEGER,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_timelines_updated ON timelines(updated_at);

        -- Scratch key/value state
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}

fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    tracing::info!("Migrating cache schema from v{} to v{}", from, to);
    set_schema_version(conn, to)?;
    Ok(())
}
