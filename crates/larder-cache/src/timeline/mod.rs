//! Timeline merge engine.
//!
//! A load walks `Idle → CacheCheck → (CacheRender) → NetworkFetch →
//! Buffering → Finalized`:
//!
//! 1. On an initial page, a fresh enough cached index is rendered at once
//!    as a provisional view. It never moves the pagination cursor.
//! 2. Every relay gets the same filter. Each is drained by its own task.
//! 3. Arrivals are deduplicated per session and rendered in debounced,
//!    newest-first flushes. The cursor follows the oldest flushed event.
//! 4. When every relay has finished, or the safety timeout fires, the rest
//!    is flushed, persisted through the write coalescers and reported.
//!
//! Every visible effect is gated on the session's [`SessionToken`].

mod buffer;
mod engine;
mod session;
mod sink;
mod sync;
mod view;

use serde::Serialize;

pub use buffer::{Accepted, Flush, MergeBuffer};
pub use engine::{LoadRequest, LoadResult, SyncRequest, SyncResult, TimelineEngine};
pub use session::{SessionRegistry, SessionToken};
pub use sink::TimelineSink;
pub use sync::spawn_background_sync;
pub use view::TimelineView;

#[cfg(test)]
pub(crate) use sink::RecordingSink;

/// Which page of a timeline is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest {
    /// The newest page. May render from cache first.
    Initial,
    /// Events at or before `until`. Never reads the cache.
    Older { until: u64 },
}

/// Where a load session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    CacheCheck,
    CacheRender,
    NetworkFetch,
    Buffering,
    Finalized,
}

/// How a load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Something was rendered.
    Loaded,
    /// Relays answered but had nothing.
    Empty,
    /// No relay answered and the cache had nothing.
    Failed,
    /// Superseded by a newer session.
    Cancelled,
}

impl LoadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Empty => "empty",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// What the view shows when nothing was rendered.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::Empty => Some("No posts found"),
            Self::Failed => Some("Failed to load"),
            Self::Loaded | Self::Cancelled => None,
        }
    }
}

/// Summary of one load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub state: LoadState,
    pub outcome: LoadOutcome,
    /// Events rendered from the network.
    pub rendered: usize,
    /// Events rendered from cache.
    pub from_cache: usize,
    /// Distinct ids relays delivered.
    pub seen: usize,
    pub relays_ok: usize,
    pub relays_failed: usize,
    /// Pagination cursor after the load (`until` for the next page).
    pub cursor: Option<u64>,
}

impl LoadReport {
    fn cancelled(state: LoadState) -> Self {
        Self {
            state,
            outcome: LoadOutcome::Cancelled,
            rendered: 0,
            from_cache: 0,
            seen: 0,
            relays_ok: 0,
            relays_failed: 0,
            cursor: None,
        }
    }
}

/// Metadata key holding the last finalized initial load of a timeline.
pub fn last_sync_key(timeline_key: &str) -> String {
    format!("last_sync:{timeline_key}")
}
