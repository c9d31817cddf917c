//! Timelines table: ordered, de-duplicated event-id indexes.
//!
//! Every operation here is gated by the timeline cache flag. With the flag
//! off, reads report no cache and writes are no-ops.

use std::collections::HashSet;

use larder_core::{Event, TimelineKind, TimelineRef};
use rusqlite::{OptionalExtension, Transaction, params};

use super::CacheStore;

/// A stored timeline index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRecord {
    pub key: String,
    pub kind: TimelineKind,
    pub owner: Option<String>,
    /// Newest-first, unique.
    pub event_ids: Vec<String>,
    /// Hint for incremental fetches, not a sort proof.
    pub newest_timestamp: Option<u64>,
    pub oldest_timestamp: Option<u64>,
    pub updated_at: i64,
}

/// A batch of ids to merge into a timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineBatch {
    /// Newest-first.
    pub event_ids: Vec<String>,
    pub newest_timestamp: Option<u64>,
    pub oldest_timestamp: Option<u64>,
}

impl TimelineBatch {
    pub fn from_ids(event_ids: Vec<String>, newest: u64, oldest: u64) -> Self {
        Self {
            event_ids,
            newest_timestamp: Some(newest),
            oldest_timestamp: Some(oldest),
        }
    }

    /// Build a batch from events already sorted newest-first.
    pub fn from_events(events: &[Event]) -> Self {
        Self {
            event_ids: events.iter().map(|e| e.id.clone()).collect(),
            newest_timestamp: events.iter().map(|e| e.created_at).max(),
            oldest_timestamp: events.iter().map(|e| e.created_at).min(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }
}

/// Result of [`CacheStore::get_cached_timeline`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedTimeline {
    /// Newest-first, in index order.
    pub events: Vec<Event>,
    pub newest_timestamp: Option<u64>,
    pub oldest_timestamp: Option<u64>,
    /// True only if an index exists and at least one of its events survived.
    pub has_cache: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    Prepend,
    Append,
}

impl CacheStore {
    /// Read a timeline index.
    pub fn get_timeline(&self, tref: &TimelineRef) -> Option<TimelineRecord> {
        if !self.timeline_flag.is_enabled() {
            return None;
        }
        let key = tref.key();
        self.with_tx("get_timeline", |tx| read_timeline(tx, &key))
    }

    /// Merge a newer batch in front of the existing ids.
    ///
    /// Returns false if nothing was written (empty batch, flag off, failure).
    pub fn prepend_timeline(&self, tref: &TimelineRef, batch: &TimelineBatch) -> bool {
        self.merge_timeline(tref, batch, Direction::Prepend)
    }

    /// Merge an older batch behind the existing ids.
    pub fn append_timeline(&self, tref: &TimelineRef, batch: &TimelineBatch) -> bool {
        self.merge_timeline(tref, batch, Direction::Append)
    }

    fn merge_timeline(&self, tref: &TimelineRef, batch: &TimelineBatch, dir: Direction) -> bool {
        if !self.timeline_flag.is_enabled() || batch.is_empty() {
            return false;
        }

        let key = tref.key();
        let now = self.now_ms();
        let cap = self.config.max_timeline_ids;

        // Read, merge and write back under one write lock so racing flushes
        // for the same key cannot lose each other's ids.
        let written = self.with_tx("merge_timeline", |tx| {
            let existing = read_timeline(tx, &key)?;
            let (old_ids, old_newest, old_oldest) = match existing {
                Some(r) => (r.event_ids, r.newest_timestamp, r.oldest_timestamp),
                None => (Vec::new(), None, None),
            };

            let mut ids = merge_ids(&old_ids, &batch.event_ids, dir);
            ids.truncate(cap);

            let newest = max_opt(old_newest, batch.newest_timestamp);
            let oldest = min_opt(old_oldest, batch.oldest_timestamp);
            let event_ids = serde_json::to_string(&ids)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

            tx.execute(
                "INSERT INTO timelines (key, kind, owner, event_ids, newest_timestamp, oldest_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                    event_ids = excluded.event_ids,
                    newest_timestamp = excluded.newest_timestamp,
                    oldest_timestamp = excluded.oldest_timestamp,
                    updated_at = excluded.updated_at",
                params![
                    key,
                    tref.kind.as_str(),
                    tref.owner,
                    event_ids,
                    newest.map(|t| t as i64),
                    oldest.map(|t| t as i64),
                    now,
                ],
            )?;
            Ok(true)
        });

        if written {
            tracing::debug!(key = %key, ids = batch.event_ids.len(), "Merged timeline batch");
            self.evict_timelines_if_needed();
        }
        written
    }

    /// Read up to `limit` cached events of a timeline, starting at `offset`.
    pub fn get_cached_timeline(
        &self,
        tref: &TimelineRef,
        limit: usize,
        offset: usize,
    ) -> CachedTimeline {
        let Some(record) = self.get_timeline(tref) else {
            return CachedTimeline::default();
        };

        let page: Vec<String> = record
            .event_ids
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let events: Vec<Event> = self
            .get_events(&page)
            .into_iter()
            .map(|cached| cached.event)
            .collect();

        CachedTimeline {
            has_cache: !events.is_empty(),
            events,
            newest_timestamp: record.newest_timestamp,
            oldest_timestamp: record.oldest_timestamp,
        }
    }

    /// Drop ids from a timeline index (e.g. after a tombstone).
    pub fn remove_from_timeline(&self, tref: &TimelineRef, ids: &[String]) -> bool {
        if !self.timeline_flag.is_enabled() || ids.is_empty() {
            return false;
        }
        let key = tref.key();
        let now = self.now_ms();
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();

        self.with_tx("remove_from_timeline", |tx| {
            let Some(record) = read_timeline(tx, &key)? else {
                return Ok(false);
            };
            let kept: Vec<&String> = record
                .event_ids
                .iter()
                .filter(|id| !doomed.contains(id.as_str()))
                .collect();
            if kept.len() == record.event_ids.len() {
                return Ok(false);
            }
            let json = serde_json::to_string(&kept)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.execute(
                "UPDATE timelines SET event_ids = ?1, updated_at = ?2 WHERE key = ?3",
                params![json, now, key],
            )?;
            Ok(true)
        })
    }

    pub fn delete_timeline(&self, tref: &TimelineRef) -> bool {
        if !self.timeline_flag.is_enabled() {
            return false;
        }
        let key = tref.key();
        self.with_tx("delete_timeline", |tx| {
            tx.execute("DELETE FROM timelines WHERE key = ?1", [key])
                .map(|n| n > 0)
        })
    }

    /// Remove every timeline index.
    ///
    /// Not gated by the flag: this is how the cache is emptied when the user
    /// switches it off.
    pub fn clear_timelines(&self) -> usize {
        self.with_tx("clear_timelines", |tx| tx.execute("DELETE FROM timelines", []))
    }

    pub fn count_timelines(&self) -> usize {
        self.with_tx("count_timelines", |tx| {
            tx.query_row("SELECT COUNT(*) FROM timelines", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }
}

fn read_timeline(tx: &Transaction<'_>, key: &str) -> rusqlite::Result<Option<TimelineRecord>> {
    let row = tx
        .query_row(
            "SELECT key, kind, owner, event_ids, newest_timestamp, oldest_timestamp, updated_at
             FROM timelines WHERE key = ?1",
            [key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((key, kind, owner, ids_json, newest, oldest, updated_at)) = row else {
        return Ok(None);
    };

    let (Ok(kind), Ok(event_ids)) = (
        kind.parse::<TimelineKind>(),
        serde_json::from_str::<Vec<String>>(&ids_json),
    ) else {
        tracing::warn!(key = %key, "Dropping corrupt timeline index");
        tx.execute("DELETE FROM timelines WHERE key = ?1", [&key])?;
        return Ok(None);
    };

    Ok(Some(TimelineRecord {
        key,
        kind,
        owner,
        event_ids,
        newest_timestamp: newest.map(|t| t as u64),
        oldest_timestamp: oldest.map(|t| t as u64),
        updated_at,
    }))
}

fn merge_ids(existing: &[String], incoming: &[String], dir: Direction) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(existing.len() + incoming.len());
    let mut out = Vec::with_capacity(existing.len() + incoming.len());

    let (first, second) = match dir {
        Direction::Prepend => (incoming, existing),
        Direction::Append => (existing, incoming),
    };
    for id in first.iter().chain(second) {
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    out
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, note};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prepend_creates_and_merges() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::home("me");

        assert!(store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["b", "a"]), 20, 10)));
        assert!(store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["d", "c", "b"]), 40, 20)));

        let record = store.get_timeline(&tref).unwrap();
        assert_eq!(record.key, "home:me");
        assert_eq!(record.event_ids, ids(&["d", "c", "b", "a"]));
        assert_eq!(record.newest_timestamp, Some(40));
        assert_eq!(record.oldest_timestamp, Some(10));
    }

    #[test]
    fn test_prepend_is_idempotent() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        let batch = TimelineBatch::from_ids(ids(&["c", "b", "a"]), 30, 10);

        store.prepend_timeline(&tref, &batch);
        let once = store.get_timeline(&tref).unwrap().event_ids;
        store.prepend_timeline(&tref, &batch);
        let twice = store.get_timeline(&tref).unwrap().event_ids;

        assert_eq!(once, twice);
    }

    #[test]
    fn test_append_keeps_existing_first() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::user("bob");
        store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["c", "b"]), 30, 20));
        store.append_timeline(&tref, &TimelineBatch::from_ids(ids(&["b", "a"]), 20, 5));

        let record = store.get_timeline(&tref).unwrap();
        assert_eq!(record.event_ids, ids(&["c", "b", "a"]));
        assert_eq!(record.newest_timestamp, Some(30));
        assert_eq!(record.oldest_timestamp, Some(5));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (store, _clock) = memory_store();
        assert!(!store.prepend_timeline(&TimelineRef::global(), &TimelineBatch::default()));
        assert_eq!(store.count_timelines(), 0);
    }

    #[test]
    fn test_index_is_capped() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        let many: Vec<String> = (0..1_200).map(|i| format!("id{i:04}")).collect();
        store.prepend_timeline(&tref, &TimelineBatch::from_ids(many, 1_200, 1));

        let record = store.get_timeline(&tref).unwrap();
        assert_eq!(record.event_ids.len(), store.config().max_timeline_ids);
        assert_eq!(record.event_ids[0], "id0000");
    }

    #[test]
    fn test_get_cached_timeline_pages_in_index_order() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        let events = vec![note("c", "x", 30), note("b", "x", 20), note("a", "x", 10)];
        store.put_events(&events, false);
        store.prepend_timeline(&tref, &TimelineBatch::from_events(&events));

        let page = store.get_cached_timeline(&tref, 2, 1);
        assert!(page.has_cache);
        assert_eq!(
            page.events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(page.newest_timestamp, Some(30));
        assert_eq!(page.oldest_timestamp, Some(10));
    }

    #[test]
    fn test_cached_timeline_without_events_has_no_cache() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["gone"]), 1, 1));
        assert!(!store.get_cached_timeline(&tref, 50, 0).has_cache);
    }

    #[test]
    fn test_flag_off_gates_timeline_io_only() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        let events = vec![note("a", "x", 10)];
        store.put_events(&events, false);
        store.prepend_timeline(&tref, &TimelineBatch::from_events(&events));

        store.timeline_flag().set(false);

        assert!(!store.get_cached_timeline(&tref, 50, 0).has_cache);
        assert!(store.get_timeline(&tref).is_none());
        assert!(!store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["z"]), 99, 99)));
        assert!(!store.append_timeline(&tref, &TimelineBatch::from_ids(ids(&["y"]), 1, 1)));
        assert!(!store.delete_timeline(&tref));

        // Events are unaffected.
        assert!(store.get_event("a").is_some());
        assert!(store.put_event(&note("b", "x", 11), false));

        store.timeline_flag().set(true);
        assert_eq!(store.get_timeline(&tref).unwrap().event_ids, ids(&["a"]));
    }

    #[test]
    fn test_remove_from_timeline() {
        let (store, _clock) = memory_store();
        let tref = TimelineRef::global();
        store.prepend_timeline(&tref, &TimelineBatch::from_ids(ids(&["c", "b", "a"]), 3, 1));

        assert!(store.remove_from_timeline(&tref, &ids(&["b"])));
        assert!(!store.remove_from_timeline(&tref, &ids(&["zzz"])));
        assert_eq!(store.get_timeline(&tref).unwrap().event_ids, ids(&["c", "a"]));
    }

    #[test]
    fn test_clear_timelines_ignores_flag() {
        let (store, _clock) = memory_store();
        store.prepend_timeline(&TimelineRef::global(), &TimelineBatch::from_ids(ids(&["a"]), 1, 1));
        store.timeline_flag().set(false);
        assert_eq!(store.clear_timelines(), 1);
        assert_eq!(store.count_timelines(), 0);
    }
}
