//! Cache size statistics.
//!
//! Byte figures are estimates from a fixed per-row size, not measured sizes.

use serde::Serialize;

use super::CacheStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventTableStats {
    pub count: usize,
    pub bytes: u64,
    pub protected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProfileTableStats {
    pub count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimelineTableStats {
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub events: EventTableStats,
    pub profiles: ProfileTableStats,
    pub timelines: TimelineTableStats,
    pub total_bytes: u64,
}

impl CacheStore {
    pub fn cache_stats(&self) -> CacheStats {
        let events = self.count_events();
        let protected = self.count_protected_events();
        let profiles = self.count_profiles();
        let timelines = self.count_timelines();

        let event_bytes = events as u64 * self.config.event_row_bytes;
        let profile_bytes = profiles as u64 * self.config.profile_row_bytes;

        metrics::gauge!("cache_events_rows").set(events as f64);

        CacheStats {
            events: EventTableStats {
                count: events,
                bytes: event_bytes,
                protected,
            },
            profiles: ProfileTableStats {
                count: profiles,
                bytes: profile_bytes,
            },
            timelines: TimelineTableStats { count: timelines },
            total_bytes: event_bytes + profile_bytes,
        }
    }
}
