//! Max-size-or-max-delay batching primitive.
//!
//! Items pushed into a [`CoalescingBuffer`] are handed to its [`BatchSink`]
//! in batches: immediately once `batch_size` items are queued, otherwise
//! after `delay` without a new push.
//!
//! Flushing is re-entrant safe. A flush takes the whole queue and writes it
//! outside the lock; anything pushed meanwhile stays queued and a follow-up
//! flush is scheduled when the running one finishes. A failed batch is
//! logged and dropped, never requeued.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::Result;

/// Destination of flushed batches.
pub trait BatchSink<T>: Send + Sync + 'static {
    fn write_batch(&self, batch: Vec<T>) -> Result<()>;
}

/// Counters kept by a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub flushes: u64,
    pub failures: u64,
    pub items_written: u64,
    pub items_dropped: u64,
}

struct State<T> {
    queue: Vec<T>,
    flushing: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every (re)schedule so a superseded timer can tell.
    timer_generation: u64,
    stats: BufferStats,
}

struct Inner<T> {
    name: &'static str,
    batch_size: usize,
    delay: Duration,
    sink: Arc<dyn BatchSink<T>>,
    state: Mutex<State<T>>,
}

/// A debounced, size-bounded write buffer.
pub struct CoalescingBuffer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CoalescingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> CoalescingBuffer<T> {
    /// # Arguments
    ///
    /// * `name` - Label used in logs and metrics
    /// * `batch_size` - Queue length that forces an immediate flush
    /// * `delay` - Debounce delay for partial batches
    /// * `sink` - Where batches go
    pub fn new(
        name: &'static str,
        batch_size: usize,
        delay: Duration,
        sink: Arc<dyn BatchSink<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                batch_size: batch_size.max(1),
                delay,
                sink,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    flushing: false,
                    timer: None,
                    timer_generation: 0,
                    stats: BufferStats::default(),
                }),
            }),
        }
    }

    /// Queue one item.
    pub fn push(&self, item: T) {
        self.extend(std::iter::once(item));
    }

    /// Queue items in order, flushing every time a batch fills up.
    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut pushed_any = false;
        for item in items {
            pushed_any = true;
            let full = {
                let mut state = self.inner.state.lock();
                state.queue.push(item);
                state.queue.len() >= self.inner.batch_size && !state.flushing
            };
            if full {
                self.flush_now();
            }
        }

        if pushed_any {
            let mut state = self.inner.state.lock();
            if !state.queue.is_empty() {
                let inline = self.schedule(&mut state);
                drop(state);
                if inline {
                    self.flush_now();
                }
            }
        }
    }

    /// Flush whatever is queued.
    ///
    /// A no-op if the queue is empty or a flush is already running (the
    /// running flush schedules a follow-up for late arrivals).
    pub fn flush_now(&self) {
        let batch = {
            let mut state = self.inner.state.lock();
            if state.flushing || state.queue.is_empty() {
                return;
            }
            state.flushing = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.queue)
        };

        let len = batch.len() as u64;
        let result = self.inner.sink.write_batch(batch);

        let mut state = self.inner.state.lock();
        state.flushing = false;
        state.stats.flushes += 1;
        match result {
            Ok(()) => {
                state.stats.items_written += len;
                metrics::counter!("coalescer_flushes_total", "coalescer" => self.inner.name)
                    .increment(1);
                tracing::debug!(coalescer = self.inner.name, items = len, "Flushed batch");
            }
            Err(e) => {
                state.stats.failures += 1;
                state.stats.items_dropped += len;
                metrics::counter!("coalescer_flush_failures_total", "coalescer" => self.inner.name)
                    .increment(1);
                tracing::error!(
                    coalescer = self.inner.name,
                    "Dropping batch of {} after flush failure: {}",
                    len,
                    e
                );
            }
        }

        if !state.queue.is_empty() {
            let inline = self.schedule(&mut state);
            drop(state);
            if inline {
                self.flush_now();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.state.lock().stats
    }

    /// Drop queued items without writing them and cancel the timer.
    pub fn discard(&self) -> usize {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_generation += 1;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    /// (Re)start the debounce timer.
    ///
    /// Returns true when there is no async runtime to run a timer on, in
    /// which case the caller must flush inline once it drops the lock.
    fn schedule(&self, state: &mut State<T>) -> bool {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_generation += 1;
        let generation = state.timer_generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return true;
        };

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let delay = self.inner.delay;
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let buffer = CoalescingBuffer { inner };
            {
                let mut state = buffer.inner.state.lock();
                if state.timer_generation != generation {
                    return;
                }
                state.timer = None;
            }
            buffer.flush_now();
        }));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<u32>>>,
    }

    impl BatchSink<u32> for RecordingSink {
        fn write_batch(&self, batch: Vec<u32>) -> Result<()> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn sizes(sink: &RecordingSink) -> Vec<usize> {
        sink.batches.lock().iter().map(Vec::len).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_then_debounce() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());

        buffer.extend(0..250);
        assert_eq!(sizes(&sink), vec![100, 100]);
        assert_eq!(buffer.pending(), 50);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(sizes(&sink), vec![100, 100]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(sizes(&sink), vec![100, 100, 50]);
        assert_eq!(buffer.stats().items_written, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_restarts_debounce() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());

        buffer.push(1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        buffer.push(2);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(sizes(&sink).is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*sink.batches.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());

        buffer.extend([1, 2, 3]);
        buffer.flush_now();
        buffer.flush_now();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sizes(&sink), vec![3]);
    }

    /// Sink that pushes more items into its own buffer while flushing.
    struct ReentrantSink {
        buffer: Mutex<Option<CoalescingBuffer<u32>>>,
        batches: Mutex<Vec<Vec<u32>>>,
    }

    impl BatchSink<u32> for ReentrantSink {
        fn write_batch(&self, batch: Vec<u32>) -> Result<()> {
            let first = self.batches.lock().is_empty();
            self.batches.lock().push(batch);
            if first && let Some(buffer) = self.buffer.lock().clone() {
                buffer.push(99);
                // Must not recurse into a second concurrent flush.
                buffer.flush_now();
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrivals_during_flush_get_follow_up() {
        let sink = Arc::new(ReentrantSink {
            buffer: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
        });
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());
        *sink.buffer.lock() = Some(buffer.clone());

        buffer.extend([1, 2]);
        buffer.flush_now();
        assert_eq!(*sink.batches.lock(), vec![vec![1, 2]]);
        assert_eq!(buffer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*sink.batches.lock(), vec![vec![1, 2], vec![99]]);

        // Break the Arc cycle.
        sink.buffer.lock().take();
    }

    struct FailingSink;

    impl BatchSink<u32> for FailingSink {
        fn write_batch(&self, _batch: Vec<u32>) -> Result<()> {
            Err(Error::Database("disk full".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_not_requeued() {
        let buffer = CoalescingBuffer::new("test", 2, Duration::from_millis(500), Arc::new(FailingSink));

        buffer.extend([1, 2, 3]);
        assert_eq!(buffer.pending(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = buffer.stats();
        assert_eq!(buffer.pending(), 0);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.items_dropped, 3);
        assert_eq!(stats.items_written, 0);
    }

    #[test]
    fn test_without_runtime_flushes_inline() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());
        buffer.extend([1, 2, 3]);
        assert_eq!(sizes(&sink), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CoalescingBuffer::new("test", 100, Duration::from_millis(500), sink.clone());
        buffer.extend([1, 2]);
        assert_eq!(buffer.discard(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sizes(&sink).is_empty());
    }
}
