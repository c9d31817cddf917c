//! Load sessions: cache check, relay fan-out, buffering and finalization.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use larder_core::{Event, Filter, KIND_CONTACTS, KIND_DELETION, TimelineKind, TimelineRef};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::buffer::{Accepted, Flush, MergeBuffer};
use super::session::SessionToken;
use super::sink::{GuardedSink, TimelineSink};
use super::{LoadOutcome, LoadReport, LoadState, PageRequest, last_sync_key};
use crate::coalesce::{EventWriteCoalescer, TimelineWriteCoalescer};
use crate::config::LoaderConfig;
use crate::relay::{RelayHealth, RelayTransport, SubscriptionItem};
use crate::store::{CacheStore, EventQuery, TimelineBatch};
use crate::{Error, Result};

/// Relay updates buffered between relay tasks and the session loop.
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// One page load.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub tref: TimelineRef,
    /// Authors to request. `None` for the global feed.
    pub authors: Option<Vec<String>>,
    pub page: PageRequest,
    /// Already displayed by the view: id -> author.
    pub known: HashMap<String, String>,
}

/// What a load changed in the view.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub report: LoadReport,
    /// Newly displayed events (cached and network): id -> author.
    pub shown: Vec<(String, String)>,
    /// Ids retracted by tombstones.
    pub removed: Vec<String>,
    /// Newest `created_at` displayed by this load.
    pub newest: Option<u64>,
}

/// One background "anything new?" check.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub tref: TimelineRef,
    pub authors: Option<Vec<String>>,
    /// Inclusive lower bound: the newest known timestamp plus one.
    pub since: u64,
    pub known: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// New events, newest first. Not rendered, not persisted.
    pub events: Vec<Event>,
    pub removed: Vec<String>,
    pub relays_ok: usize,
    pub relays_failed: usize,
    pub cancelled: bool,
}

enum RelayUpdate {
    Event(Event),
    Done {
        relay: String,
        events: u64,
        result: RelayResult,
    },
}

enum RelayResult {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Default)]
struct FanOut {
    ok: usize,
    failed: usize,
    safety_timeout: bool,
    cancelled: bool,
}

/// Runs timeline loads against the configured relays.
pub struct TimelineEngine {
    store: Arc<CacheStore>,
    events: EventWriteCoalescer,
    timelines: TimelineWriteCoalescer,
    transport: Arc<dyn RelayTransport>,
    health: Arc<RelayHealth>,
    relays: Vec<String>,
    config: LoaderConfig,
    next_subscription: AtomicU64,
}

impl TimelineEngine {
    pub fn new(
        store: Arc<CacheStore>,
        events: EventWriteCoalescer,
        timelines: TimelineWriteCoalescer,
        transport: Arc<dyn RelayTransport>,
        health: Arc<RelayHealth>,
        relays: Vec<String>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            store,
            events,
            timelines,
            transport,
            health,
            relays,
            config,
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn event_writer(&self) -> &EventWriteCoalescer {
        &self.events
    }

    pub fn timeline_writer(&self) -> &TimelineWriteCoalescer {
        &self.timelines
    }

    /// Load one page and render it into `sink`.
    pub async fn load(
        &self,
        request: LoadRequest,
        sink: &dyn TimelineSink,
        token: &SessionToken,
    ) -> LoadResult {
        let guarded = GuardedSink::new(sink, token);
        let key = request.tref.key();
        let now_secs = self.store.clock().now_secs().max(0) as u64;

        let mut state = LoadState::Idle;
        let mut buffer = MergeBuffer::new().with_known(request.known);
        let mut shown: Vec<(String, String)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        let mut from_cache = 0;

        let until = match request.page {
            PageRequest::Initial => now_secs,
            PageRequest::Older { until } => until,
        };

        if request.page == PageRequest::Initial {
            state = transition(&key, LoadState::CacheCheck);
            let cached = self
                .store
                .get_cached_timeline(&request.tref, self.config.page_limit, 0);

            if cached.has_cache && self.is_fresh(&request.tref, cached.newest_timestamp, now_secs) {
                state = transition(&key, LoadState::CacheRender);
                let mut events = cached.events;
                events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                if guarded.render_cached(&events) {
                    buffer.seed_provisional(&events);
                    from_cache = events.len();
                    shown.extend(events.iter().map(|e| (e.id.clone(), e.pubkey.clone())));
                }
            } else if cached.has_cache {
                tracing::debug!(key = %key, "Cached timeline is past the staleness ceiling");
            }
        }

        if !token.is_live() {
            return cancelled(state);
        }

        state = transition(&key, LoadState::NetworkFetch);
        let filter = self
            .timeline_filter(request.authors.as_deref())
            .until(until)
            .limit(self.config.page_limit);

        let mut emit = |flush: Flush| {
            if !flush.events.is_empty() && guarded.render_events(&flush.events) {
                shown.extend(flush.events.iter().map(|e| (e.id.clone(), e.pubkey.clone())));
            }
            if !flush.removed.is_empty() && guarded.remove_events(&flush.removed) {
                removed.extend(flush.removed);
            }
        };

        let fan_out = self
            .fan_out(&filter, token, &mut buffer, Some(&mut emit))
            .await;
        if buffer.seen_len() > 0 {
            state = LoadState::Buffering;
        }
        if fan_out.cancelled || !token.is_live() {
            return cancelled(state);
        }

        emit(buffer.take_flush());
        state = transition(&key, LoadState::Finalized);

        self.persist(&request.tref, request.page, &mut buffer, &removed);
        if request.page == PageRequest::Initial {
            let now_ms = self.store.clock().now_ms();
            self.store.set_metadata(&last_sync_key(&key), &now_ms.to_string());
        }

        let rendered = buffer.rendered();
        let outcome = if rendered + from_cache > 0 {
            LoadOutcome::Loaded
        } else if fan_out.ok == 0 {
            LoadOutcome::Failed
        } else {
            LoadOutcome::Empty
        };

        let report = LoadReport {
            state,
            outcome,
            rendered,
            from_cache,
            seen: buffer.seen_len(),
            relays_ok: fan_out.ok,
            relays_failed: fan_out.failed,
            cursor: buffer.cursor(),
        };

        metrics::counter!("timeline_loads_total", "outcome" => outcome.as_str()).increment(1);
        metrics::counter!("timeline_events_rendered_total").increment(rendered as u64);
        tracing::info!(
            key = %key,
            outcome = outcome.as_str(),
            rendered,
            from_cache,
            relays_ok = fan_out.ok,
            relays_failed = fan_out.failed,
            safety_timeout = fan_out.safety_timeout,
            "Timeline load finished"
        );
        guarded.finished(&report);

        LoadResult {
            report,
            shown,
            removed,
            newest: buffer.newest(),
        }
    }

    /// Look for events newer than the view without rendering them.
    pub async fn fetch_new(&self, request: SyncRequest, token: &SessionToken) -> SyncResult {
        let mut buffer = MergeBuffer::new()
            .with_known(request.known)
            .with_since(request.since);
        let filter = self
            .timeline_filter(request.authors.as_deref())
            .since(request.since)
            .limit(self.config.page_limit);

        let fan_out = self.fan_out(&filter, token, &mut buffer, None).await;
        if fan_out.cancelled || !token.is_live() {
            return SyncResult {
                cancelled: true,
                ..Default::default()
            };
        }

        let flush = buffer.take_flush();
        self.apply_tombstones(&request.tref, &buffer, &flush.removed);

        tracing::debug!(
            key = %request.tref.key(),
            since = request.since,
            new = flush.events.len(),
            "Background sync finished"
        );
        SyncResult {
            events: flush.events,
            removed: flush.removed,
            relays_ok: fan_out.ok,
            relays_failed: fan_out.failed,
            cancelled: false,
        }
    }

    /// Follow list of `owner` (plus `owner`), from cache or relays.
    pub async fn resolve_follows(&self, owner: &str, token: &SessionToken) -> Vec<String> {
        let cached = self
            .store
            .query_events(&EventQuery {
                authors: Some(vec![owner.to_string()]),
                kinds: Some(vec![KIND_CONTACTS]),
                limit: 1,
                ..Default::default()
            })
            .into_iter()
            .next()
            .map(|cached| cached.event);

        let contacts = match cached {
            Some(event) => Some(event),
            None => {
                let filter = Filter::new()
                    .authors([owner])
                    .kinds([KIND_CONTACTS])
                    .limit(1);
                let mut buffer = MergeBuffer::new();
                self.fan_out(&filter, token, &mut buffer, None).await;
                let newest = buffer.take_collected().into_iter().next();
                if let Some(event) = &newest
                    && token.is_live()
                {
                    self.events.enqueue(event.clone(), true);
                }
                newest
            }
        };

        let mut follows = vec![owner.to_string()];
        if let Some(contacts) = contacts {
            for pubkey in contacts.tag_values("p") {
                if !follows.iter().any(|f| f == pubkey) {
                    follows.push(pubkey.to_string());
                }
            }
        }
        tracing::debug!(owner, follows = follows.len(), "Resolved follow list");
        follows
    }

    fn timeline_filter(&self, authors: Option<&[String]>) -> Filter {
        let mut kinds = self.config.kinds.clone();
        if !kinds.contains(&KIND_DELETION) {
            kinds.push(KIND_DELETION);
        }
        let filter = Filter::new().kinds(kinds);
        match authors {
            Some(authors) => filter.authors(authors.iter().cloned()),
            None => filter,
        }
    }

    fn is_fresh(&self, tref: &TimelineRef, newest: Option<u64>, now_secs: u64) -> bool {
        if tref.kind == TimelineKind::Global {
            return true;
        }
        let ceiling = self.config.staleness_ceiling.as_secs();
        newest.is_some_and(|newest| now_secs.saturating_sub(newest) <= ceiling)
    }

    fn persist(
        &self,
        tref: &TimelineRef,
        page: PageRequest,
        buffer: &mut MergeBuffer,
        removed: &[String],
    ) {
        self.apply_tombstones(tref, buffer, removed);

        let collected = buffer.take_collected();
        if collected.is_empty() {
            return;
        }
        let batch = TimelineBatch::from_events(&collected);
        self.events.enqueue_many(collected, tref.is_protected());
        match page {
            PageRequest::Initial => self.timelines.prepend(tref.clone(), batch),
            PageRequest::Older { .. } => self.timelines.append(tref.clone(), batch),
        }
    }

    fn apply_tombstones(&self, tref: &TimelineRef, buffer: &MergeBuffer, removed: &[String]) {
        let mut unindex: HashSet<String> = removed.iter().cloned().collect();
        for tombstone in buffer.tombstones() {
            unindex.extend(self.store.apply_deletion(tombstone));
        }
        if !unindex.is_empty() {
            let ids: Vec<String> = unindex.into_iter().collect();
            self.store.remove_from_timeline(tref, &ids);
        }
    }

    fn next_subscription_id(&self) -> String {
        let n = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        format!("larder-{n}")
    }

    /// Subscribe on every relay and feed arrivals into `buffer` until all
    /// relays are done, the safety timeout fires or the session dies.
    ///
    /// With `on_flush`, buffered events are flushed to it on a debounce.
    /// Without it, everything stays in the buffer for the caller.
    async fn fan_out(
        &self,
        filter: &Filter,
        token: &SessionToken,
        buffer: &mut MergeBuffer,
        mut on_flush: Option<&mut (dyn FnMut(Flush) + Send)>,
    ) -> FanOut {
        let mut fan_out = FanOut::default();
        if self.relays.is_empty() {
            tracing::warn!("No relays configured");
            return fan_out;
        }

        let subscription_id = self.next_subscription_id();
        let (tx, mut rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let tasks: Vec<_> = self
            .relays
            .iter()
            .map(|relay| {
                tokio::spawn(drain_relay(
                    Arc::clone(&self.transport),
                    relay.clone(),
                    subscription_id.clone(),
                    filter.clone(),
                    self.config.relay_timeout,
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let mut outstanding: HashSet<String> = self.relays.iter().cloned().collect();
        let safety = tokio::time::sleep(self.config.safety_timeout);
        tokio::pin!(safety);
        let mut flush_at: Option<Instant> = None;

        while !outstanding.is_empty() {
            if !token.is_live() {
                fan_out.cancelled = true;
                break;
            }

            let debounce = async move {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut safety => {
                    fan_out.safety_timeout = true;
                    break;
                }
                _ = debounce => {
                    flush_at = None;
                    if let Some(on_flush) = on_flush.as_deref_mut() {
                        let flush = buffer.take_flush();
                        if !flush.is_empty() {
                            on_flush(flush);
                        }
                    }
                }
                update = rx.recv() => match update {
                    Some(RelayUpdate::Event(event)) => {
                        let accepted = buffer.accept(event);
                        if on_flush.is_some()
                            && matches!(accepted, Accepted::Buffered | Accepted::Tombstone)
                        {
                            flush_at = Some(Instant::now() + self.config.flush_debounce);
                        }
                    }
                    Some(RelayUpdate::Done { relay, events, result }) => {
                        outstanding.remove(&relay);
                        self.record_relay(&relay, events, &result, &mut fan_out);
                    }
                    None => break,
                }
            }
        }

        for task in tasks {
            task.abort();
        }

        if fan_out.safety_timeout && !fan_out.cancelled {
            for relay in &outstanding {
                tracing::debug!(relay = %relay, "Relay still running at safety timeout");
                self.record_relay(relay, 0, &RelayResult::TimedOut, &mut fan_out);
            }
        }
        fan_out
    }

    fn record_relay(&self, relay: &str, events: u64, result: &RelayResult, fan_out: &mut FanOut) {
        let label = match result {
            RelayResult::Completed => {
                fan_out.ok += 1;
                self.health.record_success(relay, events);
                "ok"
            }
            RelayResult::Failed(reason) => {
                fan_out.failed += 1;
                self.health.record_failure(relay, events);
                tracing::debug!(relay = %relay, "Relay failed: {}", reason);
                "error"
            }
            RelayResult::TimedOut => {
                fan_out.failed += 1;
                self.health.record_failure(relay, events);
                tracing::debug!(relay = %relay, "Relay timed out");
                "timeout"
            }
        };
        metrics::counter!("relay_subscriptions_total", "result" => label).increment(1);
    }
}

/// Drain one relay subscription into the session channel.
async fn drain_relay(
    transport: Arc<dyn RelayTransport>,
    relay: String,
    subscription_id: String,
    filter: Filter,
    timeout: Duration,
    tx: mpsc::Sender<RelayUpdate>,
) {
    let mut events = 0u64;
    let drained = tokio::time::timeout(timeout, async {
        let mut stream = transport
            .subscribe(&relay, &subscription_id, &filter)
            .await?;
        while let Some(item) = stream.next().await {
            match item {
                SubscriptionItem::Event(event) => {
                    events += 1;
                    if tx.send(RelayUpdate::Event(event)).await.is_err() {
                        return Ok(());
                    }
                }
                SubscriptionItem::EndOfStoredEvents => return Ok(()),
                SubscriptionItem::Closed(reason) => {
                    return Err(Error::Relay(format!("subscription closed: {reason}")));
                }
                SubscriptionItem::Error(reason) => return Err(Error::Relay(reason)),
            }
        }
        Result::Err(Error::Relay("stream ended before EOSE".to_string()))
    })
    .await;

    let result = match drained {
        Ok(Ok(())) => RelayResult::Completed,
        Ok(Err(e)) => RelayResult::Failed(e.to_string()),
        Err(_) => RelayResult::TimedOut,
    };
    let _ = tx
        .send(RelayUpdate::Done {
            relay,
            events,
            result,
        })
        .await;
}

fn transition(key: &str, state: LoadState) -> LoadState {
    tracing::debug!(key, ?state, "Timeline load state");
    state
}

fn cancelled(state: LoadState) -> LoadResult {
    tracing::debug!(?state, "Timeline load superseded");
    metrics::counter!("timeline_loads_total", "outcome" => LoadOutcome::Cancelled.as_str())
        .increment(1);
    LoadResult {
        report: LoadReport::cancelled(state),
        shown: Vec::new(),
        removed: Vec::new(),
        newest: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoalescerConfig;
    use crate::relay::mock::{RelayScript, ScriptedTransport};
    use crate::testing::{DAY_MS, T0_MS, memory_store, note, note_by_kind};

    fn assert_elapsed(started: Instant, secs: u64) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1),
            "elapsed {elapsed:?}"
        );
    }
    use crate::timeline::session::SessionRegistry;
    use crate::timeline::sink::RecordingSink;

    const A: &str = "wss://a.example";
    const B: &str = "wss://b.example";
    const NOW_SECS: u64 = (T0_MS / 1000) as u64;

    struct Harness {
        engine: TimelineEngine,
        store: Arc<CacheStore>,
        health: Arc<RelayHealth>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
    }

    fn harness(transport: ScriptedTransport, relays: &[&str]) -> Harness {
        let (store, clock) = memory_store();
        let coalescer = CoalescerConfig::default();
        let transport = Arc::new(transport);
        let health = Arc::new(RelayHealth::new(clock.clone()));
        let engine = TimelineEngine::new(
            store.clone(),
            EventWriteCoalescer::new(store.clone(), &coalescer),
            TimelineWriteCoalescer::new(store.clone(), &coalescer),
            transport.clone(),
            health.clone(),
            relays.iter().map(|r| r.to_string()).collect(),
            LoaderConfig::default(),
        );
        Harness {
            engine,
            store,
            health,
            transport,
            clock,
        }
    }

    fn initial(tref: TimelineRef) -> LoadRequest {
        LoadRequest {
            tref,
            authors: None,
            page: PageRequest::Initial,
            known: HashMap::new(),
        }
    }

    fn flush_writes(h: &Harness) {
        h.engine.event_writer().flush_now();
        h.engine.timeline_writer().flush_now();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_relays_merge_into_one_ordered_view() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().event(note("1", "x", 100)).event(note("2", "x", 200)).eose())
            .with_relay(B, RelayScript::new().event(note("2", "x", 200)).event(note("3", "x", 150)).eose());
        let h = harness(transport, &[A, B]);
        let sink = RecordingSink::default();

        let result = h
            .engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;

        assert_eq!(sink.rendered(), vec!["2", "3", "1"]);
        assert_eq!(result.report.seen, 3);
        assert_eq!(result.report.outcome, LoadOutcome::Loaded);
        assert_eq!(result.report.state, LoadState::Finalized);
        assert_eq!(result.report.cursor, Some(100));
        assert_eq!(result.report.relays_ok, 2);
        assert_eq!(sink.last_report(), Some(result.report.clone()));

        flush_writes(&h);
        assert_eq!(h.store.count_events(), 3);
        assert_eq!(
            h.store.get_timeline(&TimelineRef::global()).unwrap().event_ids,
            vec!["2", "3", "1"]
        );
        assert!(h.store.get_metadata("last_sync:global").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_carries_until_limit_and_deletions() {
        let transport = ScriptedTransport::new().with_relay(A, RelayScript::new().eose());
        let h = harness(transport, &[A]);
        let mut request = initial(TimelineRef::user("bob"));
        request.authors = Some(vec!["bob".to_string()]);

        h.engine
            .load(request, &RecordingSink::default(), &SessionToken::detached())
            .await;

        let (_, filter) = &h.transport.subscriptions()[0];
        assert_eq!(filter.until, Some(NOW_SECS));
        assert_eq!(filter.limit, Some(50));
        assert_eq!(filter.authors, Some(vec!["bob".to_string()]));
        assert!(filter.kinds.as_ref().unwrap().contains(&KIND_DELETION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_flushes_render_progressively() {
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("early", "x", 100))
                .delay_ms(1_000)
                .event(note("late", "x", 300))
                .eose(),
        );
        let h = harness(transport, &[A]);
        let sink = RecordingSink::default();

        h.engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;

        assert_eq!(
            *sink.batches.lock(),
            vec![vec!["early".to_string()], vec!["late".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_relay_hits_safety_timeout() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().event(note("1", "x", 100)).eose())
            .with_relay(B, RelayScript::new().event(note("2", "x", 90)).stall());
        let h = harness(transport, &[A, B]);
        // Per-relay timeout longer than the safety timeout.
        let mut config = LoaderConfig::default();
        config.relay_timeout = Duration::from_secs(60);
        let engine = TimelineEngine::new(
            h.store.clone(),
            h.engine.event_writer().clone(),
            h.engine.timeline_writer().clone(),
            h.transport.clone(),
            h.health.clone(),
            vec![A.to_string(), B.to_string()],
            config,
        );
        let sink = RecordingSink::default();

        let started = Instant::now();
        let result = engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;

        assert_elapsed(started, 8);
        assert_eq!(sink.rendered(), vec!["1", "2"]);
        assert_eq!(result.report.relays_ok, 1);
        assert_eq!(result.report.relays_failed, 1);
        assert_eq!(h.health.tally(B).failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_timeout_and_errors_count_as_empty_relays() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().event(note("1", "x", 100)).eose())
            .with_relay(B, RelayScript::new().stall());
        let h = harness(transport, &[A, B, "wss://down.example"]);
        let sink = RecordingSink::default();

        let started = Instant::now();
        let result = h
            .engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;

        assert_elapsed(started, 5);
        assert_eq!(result.report.outcome, LoadOutcome::Loaded);
        assert_eq!(result.report.relays_ok, 1);
        assert_eq!(result.report.relays_failed, 2);
        assert_eq!(h.health.tally("wss://down.example").failures, 1);
        assert_eq!(h.health.tally(A).successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_relays_failing_is_failed_not_empty() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().error("connection reset"));
        let h = harness(transport, &[A, B]);
        let sink = RecordingSink::default();

        let result = h
            .engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;

        assert_eq!(result.report.outcome, LoadOutcome::Failed);
        assert_eq!(result.report.outcome.message(), Some("Failed to load"));
        assert_eq!(sink.last_report().unwrap().outcome, LoadOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_posts_is_empty() {
        let transport = ScriptedTransport::new().with_relay(A, RelayScript::new().eose());
        let h = harness(transport, &[A]);

        let result = h
            .engine
            .load(
                initial(TimelineRef::global()),
                &RecordingSink::default(),
                &SessionToken::detached(),
            )
            .await;

        assert_eq!(result.report.outcome, LoadOutcome::Empty);
        assert_eq!(result.report.outcome.message(), Some("No posts found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_renders_first_without_moving_cursor() {
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("cached", "me", NOW_SECS - 60))
                .event(note("fresh", "me", NOW_SECS - 10))
                .eose(),
        );
        let h = harness(transport, &[A]);
        let tref = TimelineRef::home("me");
        let cached = vec![note("cached", "me", NOW_SECS - 60)];
        h.store.put_events(&cached, true);
        h.store
            .prepend_timeline(&tref, &TimelineBatch::from_events(&cached));
        let sink = RecordingSink::default();

        let result = h
            .engine
            .load(initial(tref), &sink, &SessionToken::detached())
            .await;

        assert_eq!(*sink.cached.lock(), vec![vec!["cached".to_string()]]);
        assert_eq!(sink.rendered(), vec!["fresh"]);
        assert_eq!(result.report.from_cache, 1);
        // The network request still started from now.
        assert_eq!(h.transport.subscriptions()[0].1.until, Some(NOW_SECS));
        assert_eq!(result.report.cursor, Some(NOW_SECS - 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_home_cache_is_not_rendered() {
        let transport = ScriptedTransport::new().with_relay(A, RelayScript::new().eose());
        let h = harness(transport, &[A]);
        let tref = TimelineRef::home("me");
        let old = vec![note("old", "me", NOW_SECS - 3_600)];
        h.store.put_events(&old, true);
        h.store.prepend_timeline(&tref, &TimelineBatch::from_events(&old));
        let sink = RecordingSink::default();

        h.engine
            .load(initial(tref), &sink, &SessionToken::detached())
            .await;

        assert!(sink.cached.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_disabled_skips_cache_and_index() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().event(note("1", "x", NOW_SECS)).eose());
        let h = harness(transport, &[A]);
        h.store.timeline_flag().set(false);
        let sink = RecordingSink::default();

        h.engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;
        flush_writes(&h);

        assert_eq!(h.store.count_events(), 1);
        h.store.timeline_flag().set(true);
        assert_eq!(h.store.count_timelines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_events_are_protected() {
        let transport = ScriptedTransport::new()
            .with_relay(A, RelayScript::new().event(note("mine", "me", 10)).eose());
        let h = harness(transport, &[A]);

        h.engine
            .load(
                initial(TimelineRef::home("me")),
                &RecordingSink::default(),
                &SessionToken::detached(),
            )
            .await;
        flush_writes(&h);

        assert!(h.store.get_event("mine").unwrap().is_protected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_page_appends_and_skips_cache() {
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("boundary", "x", 100))
                .event(note("older", "x", 50))
                .eose(),
        );
        let h = harness(transport, &[A]);
        let tref = TimelineRef::global();
        h.store
            .prepend_timeline(&tref, &TimelineBatch::from_ids(vec!["boundary".into()], 100, 100));
        let sink = RecordingSink::default();

        let request = LoadRequest {
            tref: tref.clone(),
            authors: None,
            page: PageRequest::Older { until: 100 },
            known: HashMap::from([("boundary".to_string(), "x".to_string())]),
        };
        let result = h
            .engine
            .load(request, &sink, &SessionToken::detached())
            .await;
        flush_writes(&h);

        assert!(sink.cached.lock().is_empty());
        assert_eq!(sink.rendered(), vec!["older"]);
        assert_eq!(result.report.cursor, Some(50));
        assert_eq!(h.transport.subscriptions()[0].1.until, Some(100));
        assert_eq!(
            h.store.get_timeline(&tref).unwrap().event_ids,
            vec!["boundary", "older"]
        );
        assert!(h.store.get_metadata("last_sync:global").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_session_has_no_effects() {
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("1", "x", 100))
                .delay_ms(2_000)
                .event(note("2", "x", 90))
                .eose(),
        );
        let h = harness(transport, &[A]);
        let slot = SessionRegistry::new();
        let token = slot.begin();
        let sink = RecordingSink::default();

        let load = h.engine.load(initial(TimelineRef::global()), &sink, &token);
        let supersede = async {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            slot.begin();
        };
        let (result, ()) = tokio::join!(load, supersede);
        flush_writes(&h);

        assert_eq!(result.report.outcome, LoadOutcome::Cancelled);
        // The first flush happened before the switch; nothing after it.
        assert_eq!(sink.rendered(), vec!["1"]);
        assert!(sink.reports.lock().is_empty());
        assert_eq!(h.store.count_events(), 0);
        assert_eq!(h.store.count_timelines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_removes_from_view_and_store() {
        let mut tombstone = note_by_kind("del", "alice", 300, KIND_DELETION);
        tombstone.tags = vec![vec!["e".to_string(), "gone".to_string()]];
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("gone", "alice", 200))
                .delay_ms(1_000)
                .event(tombstone)
                .eose(),
        );
        let h = harness(transport, &[A]);
        h.store.put_events(&[note("gone", "alice", 200)], false);
        let sink = RecordingSink::default();

        let result = h
            .engine
            .load(initial(TimelineRef::global()), &sink, &SessionToken::detached())
            .await;
        flush_writes(&h);

        assert_eq!(sink.rendered(), vec!["gone"]);
        assert_eq!(*sink.removed.lock(), vec!["gone".to_string()]);
        assert_eq!(result.removed, vec!["gone".to_string()]);
        assert!(h.store.get_event("gone").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_new_uses_since_and_skips_known() {
        let transport = ScriptedTransport::new().with_relay(
            A,
            RelayScript::new()
                .event(note("seen", "x", 1000))
                .event(note("new", "x", 1005))
                .eose(),
        );
        let h = harness(transport, &[A]);

        let result = h
            .engine
            .fetch_new(
                SyncRequest {
                    tref: TimelineRef::global(),
                    authors: None,
                    since: 1001,
                    known: HashMap::from([("seen".to_string(), "x".to_string())]),
                },
                &SessionToken::detached(),
            )
            .await;

        assert_eq!(h.transport.subscriptions()[0].1.since, Some(1001));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].id, "new");
        // Not persisted until shown.
        flush_writes(&h);
        assert_eq!(h.store.count_events(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_follows_prefers_cache() {
        let h = harness(ScriptedTransport::new(), &[A]);
        let mut contacts = note_by_kind("c", "me", 10, KIND_CONTACTS);
        contacts.tags = vec![
            vec!["p".to_string(), "alice".to_string()],
            vec!["p".to_string(), "bob".to_string()],
        ];
        h.store.put_events(&[contacts], true);

        let follows = h
            .engine
            .resolve_follows("me", &SessionToken::detached())
            .await;

        assert_eq!(follows, vec!["me", "alice", "bob"]);
        assert_eq!(h.transport.subscribe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_follows_from_network() {
        let mut contacts = note_by_kind("c", "me", 10, KIND_CONTACTS);
        contacts.tags = vec![vec!["p".to_string(), "carol".to_string()]];
        let transport = ScriptedTransport::new().with_relay(A, RelayScript::new().event(contacts).eose());
        let h = harness(transport, &[A]);

        let follows = h
            .engine
            .resolve_follows("me", &SessionToken::detached())
            .await;
        flush_writes(&h);

        assert_eq!(follows, vec!["me", "carol"]);
        assert!(h.store.get_event("c").unwrap().is_protected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_entries_are_not_rendered() {
        let transport = ScriptedTransport::new().with_relay(A, RelayScript::new().eose());
        let h = harness(transport, &[A]);
        let tref = TimelineRef::global();
        let cached = vec![note("a", "x", NOW_SECS)];
        h.store.put_events(&cached, false);
        h.store.prepend_timeline(&tref, &TimelineBatch::from_events(&cached));

        h.clock.advance_ms(15 * DAY_MS);
        let sink = RecordingSink::default();
        let result = h
            .engine
            .load(initial(tref), &sink, &SessionToken::detached())
            .await;

        assert!(sink.cached.lock().is_empty());
        assert_eq!(result.report.outcome, LoadOutcome::Empty);
        assert!(h.store.get_event("a").is_none());
    }
}
