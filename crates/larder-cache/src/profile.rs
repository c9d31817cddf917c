//! Author profile resolution.
//!
//! Lookups go through three tiers:
//!
//! 1. **Hot**: a moka cache with a short TTL. Misses are cached too, as
//!    `None`, so a render burst over profile-less authors stays local.
//! 2. **Store**: the `profiles` table, with its own TTL and staleness.
//! 3. **Network**: relays in health order; the first valid kind 0 wins.
//!
//! Concurrent lookups for one author share a single resolution. Network
//! attempts per author are spaced by a retry backoff regardless of what
//! the hot tier holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use larder_core::{Event, Filter, KIND_METADATA, ProfileMetadata};
use moka::future::Cache;
use parking_lot::Mutex;

use crate::config::ProfileConfig;
use crate::relay::{RelayHealth, RelayTransport, SubscriptionItem};
use crate::store::CacheStore;

/// Where a lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileTier {
    Hot,
    Store,
    Network,
    /// Nothing found, or the network was skipped by the backoff.
    Miss,
}

impl ProfileTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Store => "store",
            Self::Network => "network",
            Self::Miss => "miss",
        }
    }
}

pub struct ProfileResolver {
    store: Arc<CacheStore>,
    transport: Arc<dyn RelayTransport>,
    health: Arc<RelayHealth>,
    relays: Vec<String>,
    config: ProfileConfig,
    hot: Cache<String, Option<ProfileMetadata>>,
    /// Last network attempt per author, in store-clock milliseconds.
    attempts: Mutex<HashMap<String, i64>>,
    next_subscription: AtomicU64,
}

impl ProfileResolver {
    pub fn new(
        store: Arc<CacheStore>,
        transport: Arc<dyn RelayTransport>,
        health: Arc<RelayHealth>,
        relays: Vec<String>,
        config: ProfileConfig,
    ) -> Self {
        let hot = Cache::builder()
            .max_capacity(config.hot_capacity)
            .time_to_live(config.hot_ttl)
            .build();
        Self {
            store,
            transport,
            health,
            relays,
            config,
            hot,
            attempts: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Resolve an author's profile and persist a network result.
    pub async fn resolve(&self, pubkey: &str) -> Option<ProfileMetadata> {
        self.resolve_with(pubkey, true).await
    }

    /// Resolve without writing a network result to the store.
    pub async fn resolve_ephemeral(&self, pubkey: &str) -> Option<ProfileMetadata> {
        self.resolve_with(pubkey, false).await
    }

    /// Resolve an author's profile.
    ///
    /// Concurrent callers for the same author share the first caller's
    /// resolution, including its `persist` choice.
    pub async fn resolve_with(&self, pubkey: &str, persist: bool) -> Option<ProfileMetadata> {
        if let Some(hit) = self.hot.get(pubkey).await {
            record_lookup(ProfileTier::Hot);
            return hit;
        }
        self.hot
            .get_with(pubkey.to_string(), self.resolve_cold(pubkey, persist))
            .await
    }

    /// Drop the hot entry and resolve again. The retry backoff still applies.
    pub async fn refresh(&self, pubkey: &str) -> Option<ProfileMetadata> {
        self.hot.invalidate(pubkey).await;
        self.resolve(pubkey).await
    }

    /// Resolve many authors concurrently, e.g. everyone on a rendered page.
    pub async fn prefetch<I, S>(&self, pubkeys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for pubkey in pubkeys {
            let pubkey = pubkey.as_ref();
            if !unique.iter().any(|p| p == pubkey) {
                unique.push(pubkey.to_string());
            }
        }
        futures::future::join_all(unique.iter().map(|p| self.resolve(p)))
            .await
            .iter()
            .filter(|found| found.is_some())
            .count()
    }

    /// Forget every in-memory entry and backoff stamp.
    pub fn reset(&self) {
        self.hot.invalidate_all();
        self.attempts.lock().clear();
    }

    async fn resolve_cold(&self, pubkey: &str, persist: bool) -> Option<ProfileMetadata> {
        let stored = self.store.get_profile(pubkey);
        if let Some(cached) = &stored
            && !cached.is_stale
        {
            record_lookup(ProfileTier::Store);
            return Some(cached.metadata.clone());
        }

        if !self.claim_attempt(pubkey) {
            tracing::debug!(pubkey, "Profile lookup within retry backoff");
            let tier = if stored.is_some() {
                ProfileTier::Store
            } else {
                ProfileTier::Miss
            };
            record_lookup(tier);
            return stored.map(|cached| cached.metadata);
        }

        match self.fetch(pubkey).await {
            Some(metadata) => {
                if persist {
                    self.store.put_profile(pubkey, &metadata);
                }
                record_lookup(ProfileTier::Network);
                Some(metadata)
            }
            None => {
                // A stale row beats nothing.
                let tier = if stored.is_some() {
                    ProfileTier::Store
                } else {
                    ProfileTier::Miss
                };
                record_lookup(tier);
                stored.map(|cached| cached.metadata)
            }
        }
    }

    /// Stamp a network attempt unless one happened within the backoff.
    fn claim_attempt(&self, pubkey: &str) -> bool {
        let now = self.store.clock().now_ms();
        let backoff = self.config.retry_backoff.as_millis() as i64;
        let mut attempts = self.attempts.lock();
        if let Some(last) = attempts.get(pubkey)
            && now.saturating_sub(*last) < backoff
        {
            return false;
        }
        attempts.insert(pubkey.to_string(), now);
        true
    }

    async fn fetch(&self, pubkey: &str) -> Option<ProfileMetadata> {
        let filter = Filter::new()
            .authors([pubkey])
            .kinds([KIND_METADATA])
            .limit(1);

        for relay in self.health.ranked(&self.relays) {
            let id = format!(
                "larder-profile-{}",
                self.next_subscription.fetch_add(1, Ordering::Relaxed)
            );
            match self.fetch_from(&relay, &id, &filter, pubkey).await {
                Ok(Some(metadata)) => {
                    self.health.record_success(&relay, 1);
                    return Some(metadata);
                }
                Ok(None) => self.health.record_success(&relay, 0),
                Err(reason) => {
                    tracing::debug!(relay = %relay, pubkey, reason = %reason, "Profile lookup failed");
                    self.health.record_failure(&relay, 0);
                }
            }
        }
        None
    }

    async fn fetch_from(
        &self,
        relay: &str,
        subscription_id: &str,
        filter: &Filter,
        pubkey: &str,
    ) -> std::result::Result<Option<ProfileMetadata>, String> {
        let drain = async {
            let mut stream = self
                .transport
                .subscribe(relay, subscription_id, filter)
                .await
                .map_err(|e| e.to_string())?;

            let mut newest: Option<Event> = None;
            while let Some(item) = stream.next().await {
                match item {
                    SubscriptionItem::Event(event) => {
                        if event.pubkey == pubkey
                            && event.kind == KIND_METADATA
                            && newest
                                .as_ref()
                                .is_none_or(|n| event.created_at > n.created_at)
                        {
                            newest = Some(event);
                        }
                    }
                    SubscriptionItem::EndOfStoredEvents => break,
                    SubscriptionItem::Closed(reason) | SubscriptionItem::Error(reason) => {
                        if newest.is_none() {
                            return Err(reason);
                        }
                        break;
                    }
                }
            }
            Ok(newest.and_then(|event| ProfileMetadata::from_json(&event.content)))
        };

        tokio::time::timeout(self.config.relay_timeout, drain)
            .await
            .unwrap_or_else(|_| Err("timed out".to_string()))
    }
}

fn record_lookup(tier: ProfileTier) {
    metrics::counter!("profile_lookups_total", "tier" => tier.as_str()).increment(1);
}

impl std::fmt::Debug for ProfileResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileResolver")
            .field("relays", &self.relays)
            .field("hot_entries", &self.hot.entry_count())
            .finish_non_exhaustive()
    }
}
