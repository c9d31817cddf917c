//! Events table: put, lookup, query and explicit removal.

use std::collections::HashSet;

use larder_core::Event;
use rusqlite::{OptionalExtension, Row, Transaction, params};

use super::{CacheStore, ms};

/// A stored event plus its storage bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEvent {
    pub event: Event,
    /// When the row was last written (Unix ms).
    pub stored_at: i64,
    /// Belongs to the signed-in user's home timeline.
    pub is_protected: bool,
}

impl CachedEvent {
    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn pubkey(&self) -> &str {
        &self.event.pubkey
    }

    pub fn kind(&self) -> u16 {
        self.event.kind
    }

    pub fn created_at(&self) -> u64 {
        self.event.created_at
    }
}

/// Filter for [`CacheStore::query_events`]. Results are always newest-first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum rows returned; 0 means unlimited.
    pub limit: usize,
    pub offset: usize,
}

/// Raw row as read from SQLite, before TTL and JSON checks.
struct EventRow {
    id: String,
    pubkey: String,
    kind: u16,
    stored_at: i64,
    is_protected: bool,
    json: String,
}

impl EventRow {
    const COLUMNS: &'static str = "id, pubkey, kind, stored_at, is_protected, json";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            kind: row.get(2)?,
            stored_at: row.get(3)?,
            is_protected: row.get(4)?,
            json: row.get(5)?,
        })
    }
}

/// What to do with a row we just read.
enum RowFate {
    Keep(CachedEvent),
    Expired,
    Corrupt,
}

impl CacheStore {
    /// Persist a batch of events in one transaction.
    ///
    /// Re-putting an existing id refreshes `stored_at` and can only ever set
    /// the protected flag, never clear it. May trigger event eviction after
    /// the batch commits.
    ///
    /// Returns the number of rows written.
    pub fn put_events(&self, events: &[Event], protected: bool) -> usize {
        if events.is_empty() {
            return 0;
        }

        let now = self.now_ms();
        let written = self.with_tx("put_events", |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO events (id, pubkey, kind, created_at, stored_at, is_protected, json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    stored_at = excluded.stored_at,
                    is_protected = MAX(events.is_protected, excluded.is_protected)",
            )?;

            let mut written = 0usize;
            for event in events {
                written += stmt.execute(params![
                    event.id,
                    event.pubkey,
                    event.kind,
                    event.created_at as i64,
                    now,
                    protected,
                    event.as_json(),
                ])?;
            }
            Ok(written)
        });

        if written > 0 {
            let label = if protected { "true" } else { "false" };
            metrics::counter!("cache_events_written_total", "protected" => label)
                .increment(written as u64);
            tracing::debug!(written, protected, "Stored events");
            self.evict_events_if_needed();
        }

        written
    }

    /// Persist a single event.
    pub fn put_event(&self, event: &Event, protected: bool) -> bool {
        self.put_events(std::slice::from_ref(event), protected) == 1
    }

    /// Look up one event by id.
    ///
    /// Expired and unparseable rows are deleted and reported as absent.
    pub fn get_event(&self, id: &str) -> Option<CachedEvent> {
        let now = self.now_ms();
        self.with_tx("get_event", |tx| {
            let row = tx
                .query_row(
                    &format!("SELECT {} FROM events WHERE id = ?1", EventRow::COLUMNS),
                    [id],
                    EventRow::from_row,
                )
                .optional()?;

            match row {
                Some(row) => Ok(self.settle_rows(tx, vec![row], now).pop()),
                None => Ok(None),
            }
        })
    }

    /// Look up many events by id, preserving the order of `ids`.
    ///
    /// Missing, expired and corrupt rows are skipped.
    pub fn get_events(&self, ids: &[String]) -> Vec<CachedEvent> {
        if ids.is_empty() {
            return Vec::new();
        }

        let now = self.now_ms();
        self.with_tx("get_events", |tx| {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {} FROM events WHERE id = ?1",
                EventRow::COLUMNS
            ))?;

            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(row) = stmt.query_row([id], EventRow::from_row).optional()? {
                    rows.push(row);
                }
            }
            drop(stmt);

            Ok(self.settle_rows(tx, rows, now))
        })
    }

    /// Query events newest-first.
    ///
    /// A single-author query walks the `(pubkey, created_at)` index. Any
    /// other author set scans by `created_at` and filters authors in memory.
    pub fn query_events(&self, query: &EventQuery) -> Vec<CachedEvent> {
        if query.authors.as_ref().is_some_and(Vec::is_empty)
            || query.kinds.as_ref().is_some_and(Vec::is_empty)
        {
            return Vec::new();
        }

        let now = self.now_ms();
        let since = query.since.map_or(0, |s| s as i64);
        let until = query.until.map_or(i64::MAX, |u| u as i64);
        let kinds: Option<HashSet<u16>> = query.kinds.as_ref().map(|k| k.iter().copied().collect());
        let authors: Option<HashSet<&str>> = query
            .authors
            .as_ref()
            .map(|a| a.iter().map(String::as_str).collect());
        let wanted = if query.limit == 0 {
            usize::MAX
        } else {
            query.offset.saturating_add(query.limit)
        };

        self.with_tx("query_events", |tx| {
            let single_author = match query.authors.as_deref() {
                Some([author]) => Some(author.as_str()),
                _ => None,
            };

            let mut matched = Vec::new();
            let mut doomed: Vec<(String, RowFate)> = Vec::new();
            {
                let mut stmt;
                let mut rows = if let Some(author) = single_author {
                    stmt = tx.prepare_cached(&format!(
                        "SELECT {} FROM events
                         WHERE pubkey = ?1 AND created_at >= ?2 AND created_at <= ?3
                         ORDER BY created_at DESC, id ASC",
                        EventRow::COLUMNS
                    ))?;
                    stmt.query(params![author, since, until])?
                } else {
                    stmt = tx.prepare_cached(&format!(
                        "SELECT {} FROM events
                         WHERE created_at >= ?1 AND created_at <= ?2
                         ORDER BY created_at DESC, id ASC",
                        EventRow::COLUMNS
                    ))?;
                    stmt.query(params![since, until])?
                };

                while let Some(row) = rows.next()? {
                    let row = EventRow::from_row(row)?;
                    if authors.as_ref().is_some_and(|a| !a.contains(row.pubkey.as_str())) {
                        continue;
                    }
                    if kinds.as_ref().is_some_and(|k| !k.contains(&row.kind)) {
                        continue;
                    }
                    let id = row.id.clone();
                    match self.judge_row(row, now) {
                        RowFate::Keep(cached) => {
                            matched.push(cached);
                            if matched.len() >= wanted {
                                break;
                            }
                        }
                        fate => doomed.push((id, fate)),
                    }
                }
            }

            self.purge(tx, &doomed)?;
            Ok(matched.into_iter().skip(query.offset).collect())
        })
    }

    /// Delete events by id. Returns how many rows were removed.
    pub fn delete_events(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        self.with_tx("delete_events", |tx| delete_ids(tx, ids))
    }

    /// Apply a tombstone: delete its targets that were authored by the
    /// tombstone's own author.
    ///
    /// Returns the ids actually removed.
    pub fn apply_deletion(&self, tombstone: &Event) -> Vec<String> {
        let targets = tombstone.deletion_targets();
        if targets.is_empty() {
            return Vec::new();
        }

        let removed = self.with_tx("apply_deletion", |tx| {
            let mut stmt = tx.prepare_cached("DELETE FROM events WHERE id = ?1 AND pubkey = ?2")?;
            let mut removed = Vec::new();
            for id in &targets {
                if stmt.execute(params![id, tombstone.pubkey])? > 0 {
                    removed.push(id.clone());
                }
            }
            Ok(removed)
        });

        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), author = %tombstone.pubkey, "Applied deletion");
        }
        removed
    }

    pub fn count_events(&self) -> usize {
        self.with_tx("count_events", |tx| {
            tx.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }

    pub fn count_protected_events(&self) -> usize {
        self.with_tx("count_protected_events", |tx| {
            tx.query_row(
                "SELECT COUNT(*) FROM events WHERE is_protected = 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
    }

    fn judge_row(&self, row: EventRow, now: i64) -> RowFate {
        let ttl = if row.is_protected {
            ms(self.config.protected_event_ttl)
        } else {
            ms(self.config.event_ttl)
        };
        if now.saturating_sub(row.stored_at) > ttl {
            return RowFate::Expired;
        }

        match Event::from_json(&row.json) {
            Ok(event) => RowFate::Keep(CachedEvent {
                event,
                stored_at: row.stored_at,
                is_protected: row.is_protected,
            }),
            Err(e) => {
                tracing::warn!(id = %row.id, "Dropping corrupt cached event: {}", e);
                RowFate::Corrupt
            }
        }
    }

    /// Judge rows, delete the expired and corrupt ones, return the rest.
    fn settle_rows(
        &self,
        tx: &Transaction<'_>,
        rows: Vec<EventRow>,
        now: i64,
    ) -> Vec<CachedEvent> {
        let mut kept = Vec::with_capacity(rows.len());
        let mut doomed = Vec::new();
        for row in rows {
            let id = row.id.clone();
            match self.judge_row(row, now) {
                RowFate::Keep(cached) => kept.push(cached),
                fate => doomed.push((id, fate)),
            }
        }

        // A failed purge leaves stale rows for the next read; the kept rows
        // are still valid to return.
        if let Err(e) = self.purge(tx, &doomed) {
            tracing::warn!("Failed to purge stale events: {}", e);
        }
        kept
    }

    fn purge(&self, tx: &Transaction<'_>, doomed: &[(String, RowFate)]) -> rusqlite::Result<()> {
        if doomed.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = doomed.iter().map(|(id, _)| id.clone()).collect();
        delete_ids(tx, &ids)?;

        let expired = doomed
            .iter()
            .filter(|(_, fate)| matches!(fate, RowFate::Expired))
            .count();
        if expired > 0 {
            metrics::counter!("cache_ttl_expired_total", "table" => "events")
                .increment(expired as u64);
        }
        Ok(())
    }
}

fn delete_ids(tx: &Transaction<'_>, ids: &[String]) -> rusqlite::Result<usize> {
    let mut stmt = tx.prepare_cached("DELETE FROM events WHERE id = ?1")?;
    let mut removed = 0;
    for id in ids {
        removed += stmt.execute([id])?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DAY_MS, memory_store, note, note_by_kind};
    use larder_core::KIND_DELETION;

    // =========================================================================
    // put / get
    // =========================================================================

    #[test]
    fn test_put_and_get() {
        let (store, _clock) = memory_store();
        assert_eq!(store.put_events(&[note("a", "alice", 10)], false), 1);

        let cached = store.get_event("a").unwrap();
        assert_eq!(cached.pubkey(), "alice");
        assert_eq!(cached.created_at(), 10);
        assert!(!cached.is_protected);
        assert!(store.get_event("missing").is_none());
    }

    #[test]
    fn test_reput_never_clears_protection() {
        let (store, _clock) = memory_store();
        store.put_events(&[note("a", "alice", 10)], true);
        store.put_events(&[note("a", "alice", 10)], false);
        assert!(store.get_event("a").unwrap().is_protected);

        store.put_events(&[note("b", "bob", 10)], false);
        store.put_events(&[note("b", "bob", 10)], true);
        assert!(store.get_event("b").unwrap().is_protected);
        assert_eq!(store.count_events(), 2);
    }

    #[test]
    fn test_reput_refreshes_stored_at() {
        let (store, clock) = memory_store();
        store.put_events(&[note("a", "alice", 10)], false);
        let first = store.get_event("a").unwrap().stored_at;

        clock.advance_ms(5_000);
        store.put_events(&[note("a", "alice", 10)], false);
        assert_eq!(store.get_event("a").unwrap().stored_at, first + 5_000);
    }

    #[test]
    fn test_get_events_preserves_requested_order() {
        let (store, _clock) = memory_store();
        store.put_events(
            &[note("a", "x", 1), note("b", "x", 2), note("c", "x", 3)],
            false,
        );

        let ids: Vec<String> = ["c", "missing", "a", "b"].iter().map(|s| s.to_string()).collect();
        let got: Vec<String> = store
            .get_events(&ids)
            .into_iter()
            .map(|c| c.event.id)
            .collect();
        assert_eq!(got, vec!["c", "a", "b"]);
    }

    // =========================================================================
    // TTL
    // =========================================================================

    #[test]
    fn test_ttl_expiry_deletes_on_read() {
        let (store, clock) = memory_store();
        store.put_events(&[note("old", "alice", 10)], false);
        store.put_events(&[note("home", "alice", 11)], true);

        clock.advance_ms(15 * DAY_MS);

        assert!(store.get_event("old").is_none());
        assert!(store.get_event("home").is_some());
        // Deleted as a side effect of the failed lookup.
        assert_eq!(store.count_events(), 1);

        clock.advance_ms(16 * DAY_MS);
        assert!(store.get_events(&["home".to_string()]).is_empty());
        assert_eq!(store.count_events(), 0);
    }

    #[test]
    fn test_query_skips_and_removes_expired() {
        let (store, clock) = memory_store();
        store.put_events(&[note("old", "alice", 10)], false);
        clock.advance_ms(15 * DAY_MS);
        store.put_events(&[note("new", "alice", 5)], false);

        let results = store.query_events(&EventQuery::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), "new");
        assert_eq!(store.count_events(), 1);
    }

    #[test]
    fn test_corrupt_row_is_deleted_on_read() {
        let (store, _clock) = memory_store();
        store.put_events(&[note("a", "alice", 10)], false);
        store.with_tx("corrupt", |tx| {
            tx.execute("UPDATE events SET json = '{broken' WHERE id = 'a'", [])
        });

        assert!(store.get_event("a").is_none());
        assert_eq!(store.count_events(), 0);
    }

    // =========================================================================
    // query
    // =========================================================================

    #[test]
    fn test_query_newest_first_with_pagination() {
        let (store, _clock) = memory_store();
        let events: Vec<Event> = (0..10).map(|i| note(&format!("e{i}"), "alice", 100 + i)).collect();
        store.put_events(&events, false);

        let page = store.query_events(&EventQuery {
            limit: 3,
            offset: 2,
            ..Default::default()
        });
        let ids: Vec<&str> = page.iter().map(CachedEvent::id).collect();
        assert_eq!(ids, vec!["e7", "e6", "e5"]);
    }

    #[test]
    fn test_query_single_and_multi_author() {
        let (store, _clock) = memory_store();
        store.put_events(
            &[
                note("a1", "alice", 10),
                note("b1", "bob", 20),
                note("c1", "carol", 30),
                note("a2", "alice", 40),
            ],
            false,
        );

        let alice = store.query_events(&EventQuery {
            authors: Some(vec!["alice".into()]),
            ..Default::default()
        });
        assert_eq!(alice.iter().map(CachedEvent::id).collect::<Vec<_>>(), vec!["a2", "a1"]);

        let two = store.query_events(&EventQuery {
            authors: Some(vec!["alice".into(), "bob".into()]),
            ..Default::default()
        });
        assert_eq!(
            two.iter().map(CachedEvent::id).collect::<Vec<_>>(),
            vec!["a2", "b1", "a1"]
        );

        let none = store.query_events(&EventQuery {
            authors: Some(vec![]),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_kinds_and_time_range() {
        let (store, _clock) = memory_store();
        store.put_events(
            &[
                note_by_kind("n1", "alice", 10, 1),
                note_by_kind("r1", "alice", 20, 6),
                note_by_kind("m1", "alice", 30, 0),
                note_by_kind("n2", "alice", 40, 1),
            ],
            false,
        );

        let results = store.query_events(&EventQuery {
            kinds: Some(vec![1, 6]),
            since: Some(20),
            until: Some(40),
            ..Default::default()
        });
        assert_eq!(
            results.iter().map(CachedEvent::id).collect::<Vec<_>>(),
            vec!["n2", "r1"]
        );
    }

    // =========================================================================
    // delete / tombstones
    // =========================================================================

    #[test]
    fn test_delete_events() {
        let (store, _clock) = memory_store();
        store.put_events(&[note("a", "x", 1), note("b", "x", 2)], false);
        assert_eq!(store.delete_events(&["a".to_string(), "zzz".to_string()]), 1);
        assert_eq!(store.count_events(), 1);
    }

    #[test]
    fn test_apply_deletion_only_removes_own_events() {
        let (store, _clock) = memory_store();
        store.put_events(&[note("mine", "alice", 1), note("theirs", "bob", 2)], false);

        let mut tombstone = note_by_kind("del", "alice", 3, KIND_DELETION);
        tombstone.tags = vec![
            vec!["e".to_string(), "mine".to_string()],
            vec!["e".to_string(), "theirs".to_string()],
        ];

        assert_eq!(store.apply_deletion(&tombstone), vec!["mine"]);
        assert!(store.get_event("mine").is_none());
        assert!(store.get_event("theirs").is_some());
    }

    #[test]
    fn test_count_protected() {
        let (store, _clock) = memory_store();
        store.put_events(&[note("a", "x", 1)], true);
        store.put_events(&[note("b", "x", 2), note("c", "x", 3)], false);
        assert_eq!(store.count_protected_events(), 1);
        assert_eq!(store.count_events(), 3);
    }
}
