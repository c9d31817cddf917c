//! Application context.
//!
//! [`CacheContext`] owns every long-lived piece of the engine: the store,
//! both write coalescers, relay health, the profile resolver and the
//! timeline engine. It is created once at startup and passed by reference;
//! nothing in the crate keeps process-wide state.

use std::sync::Arc;

use larder_core::TimelineRef;

use crate::clock::{Clock, SystemClock};
use crate::coalesce::{EventWriteCoalescer, TimelineWriteCoalescer};
use crate::config::CacheConfig;
use crate::profile::ProfileResolver;
use crate::relay::{RELAY_HEALTH_KEY, RelayHealth, RelayTransport};
use crate::settings::SettingsHandle;
use crate::store::{CacheStats, CacheStore};
use crate::timeline::{SessionRegistry, TimelineEngine, TimelineSink, TimelineView};
use crate::Result;

pub struct CacheContext {
    config: CacheConfig,
    settings: SettingsHandle,
    store: Arc<CacheStore>,
    health: Arc<RelayHealth>,
    profiles: Arc<ProfileResolver>,
    engine: Arc<TimelineEngine>,
    /// The route on screen. Opening a view supersedes the previous one.
    navigation: SessionRegistry,
}

impl CacheContext {
    /// Open the store at `config.db_path` and wire everything to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// is inconsistent. An unopenable database is not an error; the engine
    /// runs without persistence.
    pub fn open(config: CacheConfig, transport: Arc<dyn RelayTransport>) -> Result<Self> {
        Self::open_with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: CacheConfig,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let settings = SettingsHandle::load(config.settings_path());
        let store = Arc::new(CacheStore::open(
            &config.db_path,
            config.store.clone(),
            settings.flag(),
            clock.clone(),
        ));

        let events = EventWriteCoalescer::new(store.clone(), &config.coalescer);
        let timelines = TimelineWriteCoalescer::new(store.clone(), &config.coalescer);
        let health = Arc::new(RelayHealth::load(&store, clock));

        let profiles = Arc::new(ProfileResolver::new(
            store.clone(),
            transport.clone(),
            health.clone(),
            config.relays.clone(),
            config.profile.clone(),
        ));
        let engine = Arc::new(TimelineEngine::new(
            store.clone(),
            events,
            timelines,
            transport,
            health.clone(),
            config.relays.clone(),
            config.loader.clone(),
        ));

        tracing::info!(
            relays = config.relays.len(),
            persistent = store.is_available(),
            timeline_cache = settings.flag().is_enabled(),
            "Cache context ready"
        );

        Ok(Self {
            config,
            settings,
            store,
            health,
            profiles,
            engine,
            navigation: SessionRegistry::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<TimelineEngine> {
        &self.engine
    }

    pub fn profiles(&self) -> &Arc<ProfileResolver> {
        &self.profiles
    }

    pub fn health(&self) -> &Arc<RelayHealth> {
        &self.health
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Navigate to a timeline. Every load of the previous view dies.
    pub fn open_view(
        &self,
        tref: TimelineRef,
        authors: Option<Vec<String>>,
        sink: Arc<dyn TimelineSink>,
    ) -> Arc<TimelineView> {
        let route = self.navigation.begin();
        Arc::new(TimelineView::new(
            self.engine.clone(),
            tref,
            authors,
            sink,
            route,
        ))
    }

    /// Navigate to `owner`'s home timeline, resolving their follows first.
    pub async fn open_home_view(
        &self,
        owner: &str,
        sink: Arc<dyn TimelineSink>,
    ) -> Arc<TimelineView> {
        let route = self.navigation.begin();
        let follows = self.engine.resolve_follows(owner, &route).await;
        Arc::new(TimelineView::new(
            self.engine.clone(),
            TimelineRef::home(owner),
            Some(follows),
            sink,
            route,
        ))
    }

    /// Switch the timeline cache on or off and persist the choice.
    ///
    /// Turning it off drops queued index writes and every stored index.
    pub fn set_timeline_cache_enabled(&self, enabled: bool) -> Result<()> {
        let saved = self.settings.set_timeline_cache_enabled(enabled);
        if !enabled {
            self.engine.timeline_writer().discard();
            let cleared = self.store.clear_timelines();
            tracing::info!(cleared, "Cleared cached timelines");
        }
        saved
    }

    pub fn stats(&self) -> CacheStats {
        self.store.cache_stats()
    }

    /// Empty the durable store and every in-memory tier.
    pub fn clear_all(&self) {
        self.engine.event_writer().discard();
        self.engine.timeline_writer().discard();
        self.store.clear_all();
        self.profiles.reset();
        self.health.reset();
    }

    /// Forget the signed-in user's in-memory state.
    ///
    /// Open views die and queued writes are dropped. Durable events stay.
    pub fn sign_out(&self) {
        self.navigation.cancel();
        let events = self.engine.event_writer().discard();
        let timelines = self.engine.timeline_writer().discard();
        self.profiles.reset();
        self.health.reset();
        self.store.delete_metadata(RELAY_HEALTH_KEY);
        tracing::info!(events, timelines, "Signed out");
    }

    /// Flush queued writes and persist relay health.
    pub fn shutdown(&self) {
        self.navigation.cancel();
        self.engine.event_writer().flush_now();
        self.engine.timeline_writer().flush_now();
        if !self.health.save(&self.store) {
            tracing::debug!("Relay health not persisted");
        }
        tracing::info!("Cache context shut down");
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("db_path", &self.config.db_path)
            .field("relays", &self.config.relays)
            .finish_non_exhaustive()
    }
}
