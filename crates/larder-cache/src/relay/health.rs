//! Per-relay success/failure tallies.
//!
//! Health never takes a relay out of rotation. It only orders relays for
//! callers that try them one at a time (profile lookups). Tallies survive
//! restarts through the `relay_health` metadata row and are cleared on
//! sign-out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::CacheStore;

/// Metadata key the tallies are persisted under.
pub const RELAY_HEALTH_KEY: &str = "relay_health";

/// Uptime assumed for a relay with no history.
const UNSEEN_UPTIME: f64 = 0.5;

/// Counters for one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTally {
    pub successes: u64,
    pub failures: u64,
    pub events_received: u64,
    /// Unix ms of the latest failure.
    pub last_failure_at: Option<i64>,
}

impl RelayTally {
    /// Fraction of subscriptions that completed without error.
    pub fn uptime(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            UNSEEN_UPTIME
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Serialized form of all tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHealthSnapshot {
    pub relays: BTreeMap<String, RelayTally>,
}

/// Shared relay health context.
pub struct RelayHealth {
    tallies: Mutex<HashMap<String, RelayTally>>,
    clock: Arc<dyn Clock>,
}

impl RelayHealth {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tallies: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Restore tallies persisted by [`save`](Self::save).
    pub fn load(store: &CacheStore, clock: Arc<dyn Clock>) -> Self {
        let health = Self::new(clock);
        if let Some(snapshot) = store.get_metadata_json::<RelayHealthSnapshot>(RELAY_HEALTH_KEY) {
            tracing::debug!("Restored health for {} relays", snapshot.relays.len());
            health.tallies.lock().extend(snapshot.relays);
        }
        health
    }

    pub fn save(&self, store: &CacheStore) -> bool {
        store.set_metadata_json(RELAY_HEALTH_KEY, &self.snapshot())
    }

    /// A subscription on `url` completed (EOSE or orderly close).
    pub fn record_success(&self, url: &str, events: u64) {
        let mut tallies = self.tallies.lock();
        let tally = tallies.entry(url.to_string()).or_default();
        tally.successes += 1;
        tally.events_received += events;
    }

    /// A subscription on `url` errored or timed out.
    pub fn record_failure(&self, url: &str, events: u64) {
        let now = self.clock.now_ms();
        let mut tallies = self.tallies.lock();
        let tally = tallies.entry(url.to_string()).or_default();
        tally.failures += 1;
        tally.events_received += events;
        tally.last_failure_at = Some(now);
    }

    pub fn tally(&self, url: &str) -> RelayTally {
        self.tallies.lock().get(url).cloned().unwrap_or_default()
    }

    pub fn uptime(&self, url: &str) -> f64 {
        self.tally(url).uptime()
    }

    /// `urls` ordered by uptime, best first. Ties keep their input order.
    pub fn ranked(&self, urls: &[String]) -> Vec<String> {
        let tallies = self.tallies.lock();
        let mut scored: Vec<(f64, &String)> = urls
            .iter()
            .map(|url| {
                let uptime = tallies.get(url).map_or(UNSEEN_UPTIME, RelayTally::uptime);
                (uptime, url)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, url)| url.clone()).collect()
    }

    pub fn snapshot(&self) -> RelayHealthSnapshot {
        RelayHealthSnapshot {
            relays: self
                .tallies
                .lock()
                .iter()
                .map(|(url, tally)| (url.clone(), tally.clone()))
                .collect(),
        }
    }

    /// Forget everything (sign-out).
    pub fn reset(&self) {
        self.tallies.lock().clear();
    }
}

impl std::fmt::Debug for RelayHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHealth")
            .field("relays", &self.tallies.lock().len())
            .finish()
    }
}
