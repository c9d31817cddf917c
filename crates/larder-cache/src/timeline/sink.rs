//! Where a timeline renders to.

use larder_core::Event;

use super::LoadReport;
use super::session::SessionToken;

/// Receives the visible effects of timeline loads.
///
/// Implementations are the UI. Every call made by the engine is gated on
/// the session still being live, so a sink never sees effects from a
/// superseded load.
pub trait TimelineSink: Send + Sync {
    /// Cached events shown before the network answers. Newest first.
    fn render_cached(&self, events: &[Event]);

    /// A flushed batch of network events. Newest first within the batch.
    fn render_events(&self, events: &[Event]);

    /// Events retracted by a tombstone.
    fn remove_events(&self, _ids: &[String]) {}

    /// The load settled. `report.outcome` says what to show if nothing
    /// was rendered.
    fn finished(&self, _report: &LoadReport) {}

    /// Background sync found `count` events newer than the view.
    fn new_events_available(&self, _count: usize) {}
}

/// Forwards to a sink only while a session is live.
pub(crate) struct GuardedSink<'a> {
    sink: &'a dyn TimelineSink,
    token: &'a SessionToken,
}

impl<'a> GuardedSink<'a> {
    pub fn new(sink: &'a dyn TimelineSink, token: &'a SessionToken) -> Self {
        Self { sink, token }
    }

    pub fn is_live(&self) -> bool {
        self.token.is_live()
    }

    pub fn render_cached(&self, events: &[Event]) -> bool {
        self.gate(|sink| sink.render_cached(events))
    }

    pub fn render_events(&self, events: &[Event]) -> bool {
        self.gate(|sink| sink.render_events(events))
    }

    pub fn remove_events(&self, ids: &[String]) -> bool {
        self.gate(|sink| sink.remove_events(ids))
    }

    pub fn finished(&self, report: &LoadReport) -> bool {
        self.gate(|sink| sink.finished(report))
    }

    pub fn new_events_available(&self, count: usize) -> bool {
        self.gate(|sink| sink.new_events_available(count))
    }

    fn gate(&self, effect: impl FnOnce(&dyn TimelineSink)) -> bool {
        if self.token.is_live() {
            effect(self.sink);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;
