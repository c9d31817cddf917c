//! Batched event persistence.

use std::sync::Arc;

use larder_core::Event;

use super::buffer::{BatchSink, BufferStats, CoalescingBuffer};
use crate::config::CoalescerConfig;
use crate::store::CacheStore;
use crate::{Error, Result};

/// An event waiting to be persisted.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: Event,
    /// Part of the signed-in user's home timeline.
    pub is_home: bool,
}

struct EventStoreSink {
    store: Arc<CacheStore>,
}

impl BatchSink<PendingEvent> for EventStoreSink {
    /// Writes home and non-home events as two batched store calls.
    fn write_batch(&self, batch: Vec<PendingEvent>) -> Result<()> {
        if !self.store.is_available() {
            return Ok(());
        }

        let (home, other): (Vec<_>, Vec<_>) = batch.into_iter().partition(|p| p.is_home);

        for (pending, protected) in [(home, true), (other, false)] {
            if pending.is_empty() {
                continue;
            }
            let events: Vec<Event> = pending.into_iter().map(|p| p.event).collect();
            if self.store.put_events(&events, protected) == 0 {
                return Err(Error::Database(format!(
                    "{} events (protected={}) were not persisted",
                    events.len(),
                    protected
                )));
            }
        }
        Ok(())
    }
}

/// Coalesces event writes from many relay streams into batched store calls.
#[derive(Clone)]
pub struct EventWriteCoalescer {
    buffer: CoalescingBuffer<PendingEvent>,
}

impl EventWriteCoalescer {
    pub fn new(store: Arc<CacheStore>, config: &CoalescerConfig) -> Self {
        Self {
            buffer: CoalescingBuffer::new(
                "events",
                config.batch_size,
                config.delay,
                Arc::new(EventStoreSink { store }),
            ),
        }
    }

    pub fn enqueue(&self, event: Event, is_home: bool) {
        self.buffer.push(PendingEvent { event, is_home });
    }

    pub fn enqueue_many<I>(&self, events: I, is_home: bool)
    where
        I: IntoIterator<Item = Event>,
    {
        self.buffer
            .extend(events.into_iter().map(|event| PendingEvent { event, is_home }));
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

    /// Drop queued writes (used on sign-out).
    pub fn discard(&self) -> usize {
        self.buffer.discard()
    }
}
