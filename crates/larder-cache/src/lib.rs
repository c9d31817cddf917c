//! Offline cache and timeline-merge engine for a multi-relay Nostr client.
//!
//! # Modules
//!
//! - [`store`] - SQLite-backed events, profiles, timeline indexes and metadata
//! - [`coalesce`] - Batched writes into the store
//! - [`relay`] - Relay transport abstraction, WebSocket transport, relay health
//! - [`timeline`] - Cache-first loads that merge many relay streams into one view
//! - [`profile`] - Three-tier author profile resolution
//! - [`context`] - Wires all of the above for one application
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ TimelineView │  per-route state, pages, background sync
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐  cache-first   ┌──────────────┐
//! │TimelineEngine│ ─────────────► │  CacheStore  │  SQLite
//! └──────┬───────┘                └──────▲───────┘
//!        │ fan-out                       │ batched
//!        ▼                               │
//! ┌──────────────┐   events      ┌───────┴────────┐
//! │RelayTransport│ ────────────► │ Write coalescer│
//! └──────────────┘               └────────────────┘
//! ```
//!
//! The store is the only shared mutable resource. Event and timeline writes
//! go through the coalescers; profiles and metadata are written directly.

pub mod clock;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod error;
pub mod profile;
pub mod relay;
pub mod settings;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod timeline;

pub use error::{Error, Result};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CoalescerConfig, LoaderConfig, ProfileConfig, StoreConfig};
pub use context::CacheContext;
pub use profile::{ProfileResolver, ProfileTier};
pub use relay::{
    RelayHealth, RelayTransport, SubscriptionItem, SubscriptionStream, WebSocketTransport,
};
pub use settings::{Settings, SettingsHandle, TimelineCacheFlag};
pub use store::{CacheStats, CacheStore};
pub use timeline::{
    LoadOutcome, LoadReport, LoadState, PageRequest, SessionRegistry, SessionToken,
    TimelineEngine, TimelineSink, TimelineView, spawn_background_sync,
};
