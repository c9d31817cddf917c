//! Capacity eviction.
//!
//! Eviction is opportunistic: the write paths call the `*_if_needed`
//! helpers after their own transaction commits, and each pass runs in a
//! transaction of its own.
//!
//! | Table     | Soft / target | Order                  | Exempt              |
//! |-----------|---------------|------------------------|---------------------|
//! | events    | 5000 / 3000   | `stored_at` ascending  | `is_protected = 1`  |
//! | profiles  | 2000 / 1500   | `last_accessed_at` asc | none                |
//! | timelines | 50 / 30       | `updated_at` ascending | `home`, `global`    |

use rusqlite::params;

use super::CacheStore;

/// What one eviction pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub table: &'static str,
    pub before: usize,
    pub removed: usize,
}

impl CacheStore {
    /// Evict events if the table is over its soft limit.
    ///
    /// Oldest unprotected rows go first. Protected rows are never deleted
    /// and never count toward the quota, so the table may stay above the
    /// target when most rows are protected.
    pub fn evict_events_if_needed(&self) -> Option<EvictionReport> {
        let soft = self.config.event_soft_limit;
        let target = self.config.event_prune_target;

        let report = self.with_tx("evict_events", |tx| {
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            let total = total as usize;
            if total <= soft {
                return Ok(None);
            }

            let excess = total.saturating_sub(target);
            let removed = tx.execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE is_protected = 0
                    ORDER BY stored_at ASC, created_at ASC
                    LIMIT ?1
                 )",
                params![excess as i64],
            )?;

            Ok(Some(EvictionReport {
                table: "events",
                before: total,
                removed,
            }))
        });

        record(report)
    }

    /// Evict least-recently-read profiles if over the soft limit.
    pub fn evict_profiles_if_needed(&self) -> Option<EvictionReport> {
        let soft = self.config.profile_soft_limit;
        let target = self.config.profile_prune_target;

        let report = self.with_tx("evict_profiles", |tx| {
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
            let total = total as usize;
            if total <= soft {
                return Ok(None);
            }

            let removed = tx.execute(
                "DELETE FROM profiles WHERE pubkey IN (
                    SELECT pubkey FROM profiles
                    ORDER BY last_accessed_at ASC
                    LIMIT ?1
                 )",
                params![total.saturating_sub(target) as i64],
            )?;

            Ok(Some(EvictionReport {
                table: "profiles",
                before: total,
                removed,
            }))
        });

        record(report)
    }

    /// Evict least-recently-updated timelines if over the soft limit.
    ///
    /// `home` and `global` rows are kept regardless of age.
    pub fn evict_timelines_if_needed(&self) -> Option<EvictionReport> {
        if !self.timeline_flag.is_enabled() {
            return None;
        }
        let soft = self.config.timeline_soft_limit;
        let target = self.config.timeline_prune_target;

        let report = self.with_tx("evict_timelines", |tx| {
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM timelines", [], |row| row.get(0))?;
            let total = total as usize;
            if total <= soft {
                return Ok(None);
            }

            let removed = tx.execute(
                "DELETE FROM timelines WHERE key IN (
                    SELECT key FROM timelines
                    WHERE kind NOT IN ('home', 'global')
                    ORDER BY updated_at ASC
                    LIMIT ?1
                 )",
                params![total.saturating_sub(target) as i64],
            )?;

            Ok(Some(EvictionReport {
                table: "timelines",
                before: total,
                removed,
            }))
        });

        record(report)
    }

    /// Run every eviction pass now, regardless of which table was written.
    pub fn run_eviction(&self) -> Vec<EvictionReport> {
        [
            self.evict_events_if_needed(),
            self.evict_profiles_if_needed(),
            self.evict_timelines_if_needed(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn record(report: Option<EvictionReport>) -> Option<EvictionReport> {
    if let Some(r) = &report {
        metrics::counter!("cache_events_evicted_total", "table" => r.table)
            .increment(r.removed as u64);
        tracing::info!(
            "Evicted {} of {} rows from {}",
            r.removed,
            r.before,
            r.table
        );
    }
    report
}
