//! Batched timeline index updates.
//!
//! Within one flush, updates are grouped by `(timeline key, direction)` and
//! each group becomes a single store transaction. Prepend batches merge
//! newest arrival first; append batches merge in arrival order.

use std::sync::Arc;

use larder_core::TimelineRef;

use super::buffer::{BatchSink, BufferStats, CoalescingBuffer};
use crate::config::CoalescerConfig;
use crate::store::{CacheStore, TimelineBatch};
use crate::{Error, Result};

/// Which end of the index a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeDirection {
    /// Newer than everything stored.
    Prepend,
    /// Older than everything stored.
    Append,
}

#[derive(Debug, Clone)]
pub struct TimelineUpdate {
    pub tref: TimelineRef,
    pub direction: MergeDirection,
    pub batch: TimelineBatch,
}

struct TimelineStoreSink {
    store: Arc<CacheStore>,
}

impl BatchSink<TimelineUpdate> for TimelineStoreSink {
    fn write_batch(&self, batch: Vec<TimelineUpdate>) -> Result<()> {
        if !self.store.is_available() || !self.store.timeline_flag().is_enabled() {
            return Ok(());
        }

        let mut failed = Vec::new();
        for (tref, direction, merged) in group_updates(batch) {
            let ok = match direction {
                MergeDirection::Prepend => self.store.prepend_timeline(&tref, &merged),
                MergeDirection::Append => self.store.append_timeline(&tref, &merged),
            };
            if !ok && !merged.is_empty() {
                failed.push(tref.key());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Database(format!(
                "timeline updates not persisted: {}",
                failed.join(", ")
            )))
        }
    }
}

/// Group updates by key and direction, merging each group into one batch.
fn group_updates(updates: Vec<TimelineUpdate>) -> Vec<(TimelineRef, MergeDirection, TimelineBatch)> {
    let mut groups: Vec<(TimelineRef, MergeDirection, Vec<TimelineBatch>)> = Vec::new();
    for update in updates {
        match groups
            .iter_mut()
            .find(|(tref, dir, _)| *dir == update.direction && tref.key() == update.tref.key())
        {
            Some((_, _, batches)) => batches.push(update.batch),
            None => groups.push((update.tref, update.direction, vec![update.batch])),
        }
    }

    groups
        .into_iter()
        .map(|(tref, direction, mut batches)| {
            if direction == MergeDirection::Prepend {
                batches.reverse();
            }
            (tref, direction, merge_batches(batches))
        })
        .collect()
}

fn merge_batches(batches: Vec<TimelineBatch>) -> TimelineBatch {
    let mut merged = TimelineBatch::default();
    let mut seen = std::collections::HashSet::new();
    for batch in batches {
        for id in batch.event_ids {
            if seen.insert(id.clone()) {
                merged.event_ids.push(id);
            }
        }
        merged.newest_timestamp = match (merged.newest_timestamp, batch.newest_timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        merged.oldest_timestamp = match (merged.oldest_timestamp, batch.oldest_timestamp) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    merged
}

/// Coalesces timeline prepend/append requests.
#[derive(Clone)]
pub struct TimelineWriteCoalescer {
    buffer: CoalescingBuffer<TimelineUpdate>,
}

impl TimelineWriteCoalescer {
    pub fn new(store: Arc<CacheStore>, config: &CoalescerConfig) -> Self {
        Self {
            buffer: CoalescingBuffer::new(
                "timelines",
                config.batch_size,
                config.delay,
                Arc::new(TimelineStoreSink { store }),
            ),
        }
    }

    pub fn prepend(&self, tref: TimelineRef, batch: TimelineBatch) {
        self.enqueue(tref, MergeDirection::Prepend, batch);
    }

    pub fn append(&self, tref: TimelineRef, batch: TimelineBatch) {
        self.enqueue(tref, MergeDirection::Append, batch);
    }

    pub fn enqueue(&self, tref: TimelineRef, direction: MergeDirection, batch: TimelineBatch) {
        if batch.is_empty() {
            return;
        }
        self.buffer.push(TimelineUpdate {
            tref,
            direction,
            batch,
        });
    }

    pub fn flush_now(&self) {
        self.buffer.flush_now();
    }

    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn discard(&self) -> usize {
        self.buffer.discard()
    }
}
