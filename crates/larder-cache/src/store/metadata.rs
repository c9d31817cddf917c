//! Metadata table: last-writer-wins scratch state.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CacheStore;

impl CacheStore {
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.with_tx("get_metadata", |tx| {
            tx.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> bool {
        let now = self.now_ms();
        self.with_tx("set_metadata", |tx| {
            tx.execute(
                "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map(|n| n > 0)
        })
    }

    pub fn delete_metadata(&self, key: &str) -> bool {
        self.with_tx("delete_metadata", |tx| {
            tx.execute("DELETE FROM metadata WHERE key = ?1", [key])
                .map(|n| n > 0)
        })
    }

    /// Read a JSON-encoded metadata value. Unparseable values are absent.
    pub fn get_metadata_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_metadata(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, "Ignoring unparseable metadata: {}", e);
                None
            }
        }
    }

    pub fn set_metadata_json<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.set_metadata(key, &json),
            Err(e) => {
                tracing::warn!(key, "Failed to encode metadata: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::memory_store;
    use std::collections::HashMap;

    #[test]
    fn test_last_writer_wins() {
        let (store, _clock) = memory_store();
        assert!(store.get_metadata("k").is_none());
        store.set_metadata("k", "one");
        store.set_metadata("k", "two");
        assert_eq!(store.get_metadata("k").as_deref(), Some("two"));
        assert!(store.delete_metadata("k"));
        assert!(store.get_metadata("k").is_none());
    }

    #[test]
    fn test_json_helpers() {
        let (store, _clock) = memory_store();
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1u64);
        store.set_metadata_json("map", &map);
        assert_eq!(store.get_metadata_json::<HashMap<String, u64>>("map"), Some(map));

        store.set_metadata("bad", "{nope");
        assert!(store.get_metadata_json::<HashMap<String, u64>>("bad").is_none());
    }
}
