//! Profiles table.

use larder_core::ProfileMetadata;
use rusqlite::{OptionalExtension, params};

use super::{CacheStore, ms};

/// A stored profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProfile {
    pub pubkey: String,
    pub metadata: ProfileMetadata,
    pub stored_at: i64,
    pub last_accessed_at: i64,
    /// Older than the staleness threshold: usable, but should be refetched.
    pub is_stale: bool,
}

impl CacheStore {
    /// Store (overwrite) a profile. May trigger LRU eviction.
    pub fn put_profile(&self, pubkey: &str, metadata: &ProfileMetadata) -> bool {
        let now = self.now_ms();
        let content = metadata.to_json();
        let written = self.with_tx("put_profile", |tx| {
            tx.execute(
                "INSERT INTO profiles (pubkey, content, stored_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(pubkey) DO UPDATE SET
                    content = excluded.content,
                    stored_at = excluded.stored_at,
                    last_accessed_at = excluded.last_accessed_at",
                params![pubkey, content, now],
            )
            .map(|n| n > 0)
        });

        if written {
            self.evict_profiles_if_needed();
        }
        written
    }

    /// Read a profile and bump its LRU stamp.
    ///
    /// Rows past the hard TTL, or whose content no longer parses, are
    /// deleted and reported as absent.
    pub fn get_profile(&self, pubkey: &str) -> Option<CachedProfile> {
        let now = self.now_ms();
        let ttl = ms(self.config.profile_ttl);
        let stale_after = ms(self.config.profile_stale_after);

        self.with_tx("get_profile", |tx| {
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT content, stored_at FROM profiles WHERE pubkey = ?1",
                    [pubkey],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((content, stored_at)) = row else {
                return Ok(None);
            };

            let age = now.saturating_sub(stored_at);
            if age > ttl {
                tx.execute("DELETE FROM profiles WHERE pubkey = ?1", [pubkey])?;
                metrics::counter!("cache_ttl_expired_total", "table" => "profiles").increment(1);
                return Ok(None);
            }

            let Some(metadata) = ProfileMetadata::from_json(&content) else {
                tracing::warn!(pubkey, "Dropping corrupt cached profile");
                tx.execute("DELETE FROM profiles WHERE pubkey = ?1", [pubkey])?;
                return Ok(None);
            };

            tx.execute(
                "UPDATE profiles SET last_accessed_at = ?1 WHERE pubkey = ?2",
                params![now, pubkey],
            )?;

            Ok(Some(CachedProfile {
                pubkey: pubkey.to_string(),
                metadata,
                stored_at,
                last_accessed_at: now,
                is_stale: age > stale_after,
            }))
        })
    }

    pub fn delete_profile(&self, pubkey: &str) -> bool {
        self.with_tx("delete_profile", |tx| {
            tx.execute("DELETE FROM profiles WHERE pubkey = ?1", [pubkey])
                .map(|n| n > 0)
        })
    }

    pub fn count_profiles(&self) -> usize {
        self.with_tx("count_profiles", |tx| {
            tx.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }
}
