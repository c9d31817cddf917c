//! Shared fixtures for unit tests.

use std::sync::Arc;

use larder_core::{Event, KIND_TEXT_NOTE};

use crate::clock::ManualClock;
use crate::config::StoreConfig;
use crate::settings::TimelineCacheFlag;
use crate::store::CacheStore;

pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Clock start used by fixtures: 2023-11-14T22:13:20Z.
pub const T0_MS: i64 = 1_700_000_000_000;

/// Unsigned text note. Only the fields the engine looks at are meaningful.
pub fn note(id: &str, pubkey: &str, created_at: u64) -> Event {
    note_by_kind(id, pubkey, created_at, KIND_TEXT_NOTE)
}

pub fn note_by_kind(id: &str, pubkey: &str, created_at: u64, kind: u16) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: Vec::new(),
        content: format!("note {id}"),
        sig: String::new(),
    }
}

/// In-memory store with default limits and a manual clock at [`T0_MS`].
pub fn memory_store() -> (Arc<CacheStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0_MS));
    let store = CacheStore::open_in_memory(
        StoreConfig::default(),
        TimelineCacheFlag::default(),
        clock.clone(),
    );
    (Arc::new(store), clock)
}
