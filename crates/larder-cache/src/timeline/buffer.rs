//! Per-session merge buffer.
//!
//! Events from every relay of one load land here. The buffer dedups them
//! against the session's seen set, holds them until the next flush, sorts
//! each flush newest first and tracks the pagination cursor. Tombstones
//! retract their targets from the buffer and, if already shown, from the
//! view.

use std::collections::{HashMap, HashSet};

use larder_core::Event;

/// What [`MergeBuffer::accept`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// New; queued for the next flush.
    Buffered,
    /// Already shown from cache; now confirmed by a relay.
    Confirmed,
    /// Seen earlier in this session or already in the view.
    Duplicate,
    /// Older than the session's lower bound.
    OutOfRange,
    /// A tombstone. Its targets were retracted.
    Tombstone,
    /// Target of a tombstone that arrived first.
    Retracted,
}

/// The output of one flush.
#[derive(Debug, Default)]
pub struct Flush {
    /// Newest first.
    pub events: Vec<Event>,
    /// Ids to take out of the view.
    pub removed: Vec<String>,
}

impl Flush {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MergeBuffer {
    /// Ids delivered by relays this session.
    seen: HashSet<String>,
    /// Already in the view from earlier pages: id -> author.
    known: HashMap<String, String>,
    /// Shown from cache this session but not yet confirmed: id -> author.
    provisional: HashMap<String, String>,
    pending: Vec<Event>,
    /// Every network event kept this session, for persistence.
    collected: Vec<Event>,
    /// Tombstone targets not seen yet: id -> tombstone author.
    deleted: HashMap<String, String>,
    tombstones: Vec<Event>,
    removed: Vec<String>,
    since: Option<u64>,
    cursor: Option<u64>,
    unflushed_min: Option<u64>,
    newest: Option<u64>,
    rendered: usize,
}

impl MergeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `known` (id -> author) as already displayed.
    pub fn with_known(mut self, known: HashMap<String, String>) -> Self {
        self.known = known;
        self
    }

    /// Drop arrivals created before `since`.
    pub fn with_since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Record cached events shown ahead of the network. They do not move
    /// the cursor.
    pub fn seed_provisional(&mut self, events: &[Event]) {
        for event in events {
            self.provisional
                .insert(event.id.clone(), event.pubkey.clone());
            self.newest = self.newest.max(Some(event.created_at));
        }
    }

    pub fn accept(&mut self, event: Event) -> Accepted {
        if event.is_deletion() {
            if !self.seen.insert(event.id.clone()) {
                return Accepted::Duplicate;
            }
            self.apply_tombstone(event);
            return Accepted::Tombstone;
        }

        if self.since.is_some_and(|since| event.created_at < since) {
            return Accepted::OutOfRange;
        }
        if self
            .deleted
            .get(&event.id)
            .is_some_and(|author| *author == event.pubkey)
        {
            return Accepted::Retracted;
        }
        if self.known.contains_key(&event.id) || !self.seen.insert(event.id.clone()) {
            return Accepted::Duplicate;
        }

        self.unflushed_min = Some(
            self.unflushed_min
                .map_or(event.created_at, |min| min.min(event.created_at)),
        );
        self.newest = self.newest.max(Some(event.created_at));

        if self.provisional.remove(&event.id).is_some() {
            self.collected.push(event);
            return Accepted::Confirmed;
        }

        self.collected.push(event.clone());
        self.pending.push(event);
        Accepted::Buffered
    }

    fn apply_tombstone(&mut self, tombstone: Event) {
        for target in tombstone.deletion_targets() {
            if let Some(pos) = self
                .pending
                .iter()
                .position(|e| e.id == target && e.pubkey == tombstone.pubkey)
            {
                // Never shown, so nothing to retract from the view.
                self.pending.remove(pos);
                self.collected.retain(|e| e.id != target);
                continue;
            }

            let same_author = self
                .collected
                .iter()
                .find(|e| e.id == target)
                .map(|e| e.pubkey.as_str())
                .or_else(|| self.provisional.get(&target).map(String::as_str))
                .or_else(|| self.known.get(&target).map(String::as_str))
                .map(|author| author == tombstone.pubkey);

            match same_author {
                Some(true) => {
                    self.collected.retain(|e| e.id != target);
                    self.provisional.remove(&target);
                    self.known.remove(&target);
                    self.removed.push(target);
                }
                Some(false) => {
                    tracing::debug!(target = %target, "Ignoring tombstone from a different author");
                }
                None => {
                    self.deleted.insert(target, tombstone.pubkey.clone());
                }
            }
        }
        self.tombstones.push(tombstone);
    }

    /// Take everything waiting to be shown.
    pub fn take_flush(&mut self) -> Flush {
        let mut events = std::mem::take(&mut self.pending);
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        self.rendered += events.len();

        if let Some(min) = self.unflushed_min.take() {
            self.cursor = Some(self.cursor.map_or(min, |cursor| cursor.min(min)));
        }

        Flush {
            events,
            removed: std::mem::take(&mut self.removed),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.removed.is_empty()
    }

    /// Distinct ids relays delivered this session.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Network events handed to the view so far.
    pub fn rendered(&self) -> usize {
        self.rendered
    }

    /// Oldest `created_at` flushed so far.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Newest `created_at` among cached and network events.
    pub fn newest(&self) -> Option<u64> {
        self.newest
    }

    /// Network events to persist, newest first.
    pub fn take_collected(&mut self) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.collected);
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        events
    }

    pub fn tombstones(&self) -> &[Event] {
        &self.tombstones
    }
}
