//! Periodic background sync for a live view.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::view::TimelineView;

/// Check `view` for new events every `interval` until its route goes away.
///
/// The first check happens one interval after spawning. Cycles never
/// overlap: a slow check delays the next tick instead of stacking up.
pub fn spawn_background_sync(view: Arc<TimelineView>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !view.is_live() {
                break;
            }
            match view.sync_once().await {
                Some(pending) => {
                    tracing::debug!(key = %view.tref().key(), pending, "Sync cycle done");
                }
                None if !view.is_live() => break,
                None => {}
            }
        }
        tracing::debug!(key = %view.tref().key(), "Background sync stopped");
    })
}
