//! Write coalescing.
//!
//! Relay traffic arrives one event at a time from many sockets. The
//! coalescers here turn that trickle into a bounded number of store
//! transactions: one per batch of events, one per timeline key and
//! direction per flush.

pub mod buffer;
mod events;
mod timelines;

pub use buffer::{BatchSink, BufferStats, CoalescingBuffer};
pub use events::{EventWriteCoalescer, PendingEvent};
pub use timelines::{MergeDirection, TimelineUpdate, TimelineWriteCoalescer};
