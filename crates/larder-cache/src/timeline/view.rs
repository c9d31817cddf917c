//! Per-route timeline state across pages and sync cycles.

use std::collections::HashMap;
use std::sync::Arc;

use larder_core::{Event, TimelineRef};
use parking_lot::Mutex;

use super::engine::{LoadRequest, LoadResult, SyncRequest, TimelineEngine};
use super::session::{SessionRegistry, SessionToken};
use super::sink::{GuardedSink, TimelineSink};
use super::{LoadReport, PageRequest};
use crate::store::TimelineBatch;

#[derive(Debug, Default)]
struct ViewState {
    /// Displayed events: id -> author.
    rendered: HashMap<String, String>,
    cursor: Option<u64>,
    newest: Option<u64>,
    /// Found by background sync, not yet shown.
    pending: Vec<Event>,
    page_loading: bool,
    loaded_at: Option<u64>,
    last_report: Option<LoadReport>,
}

/// One timeline on screen.
///
/// Holds what has been rendered, the pagination cursor and events found by
/// background sync. A reload supersedes any load in flight; dropping the
/// route token stops every load and sync the view started.
pub struct TimelineView {
    engine: Arc<TimelineEngine>,
    tref: TimelineRef,
    authors: Option<Vec<String>>,
    sink: Arc<dyn TimelineSink>,
    route: SessionToken,
    loads: SessionRegistry,
    syncs: SessionRegistry,
    state: Mutex<ViewState>,
}

impl TimelineView {
    pub fn new(
        engine: Arc<TimelineEngine>,
        tref: TimelineRef,
        authors: Option<Vec<String>>,
        sink: Arc<dyn TimelineSink>,
        route: SessionToken,
    ) -> Self {
        Self {
            engine,
            tref,
            authors,
            sink,
            route,
            loads: SessionRegistry::new(),
            syncs: SessionRegistry::new(),
            state: Mutex::new(ViewState::default()),
        }
    }

    pub fn tref(&self) -> &TimelineRef {
        &self.tref
    }

    /// False once the route has been navigated away from.
    pub fn is_live(&self) -> bool {
        self.route.is_live()
    }

    /// Load the newest page, discarding whatever the view showed before.
    pub async fn load_initial(&self) -> LoadReport {
        let token = self.loads.begin_child(&self.route);
        self.syncs.cancel();

        let now_secs = self.engine.store().clock().now_secs().max(0) as u64;
        {
            let mut state = self.state.lock();
            *state = ViewState {
                page_loading: true,
                loaded_at: Some(now_secs),
                ..Default::default()
            };
        }

        let request = LoadRequest {
            tref: self.tref.clone(),
            authors: self.authors.clone(),
            page: PageRequest::Initial,
            known: HashMap::new(),
        };
        let result = self.engine.load(request, self.sink.as_ref(), &token).await;
        self.apply(&token, &result);
        result.report
    }

    /// Load the page before the cursor.
    ///
    /// Returns `None` if there is no cursor yet or another page is loading.
    pub async fn load_older(&self) -> Option<LoadReport> {
        let (until, known) = {
            let mut state = self.state.lock();
            if state.page_loading {
                return None;
            }
            let until = state.cursor?;
            state.page_loading = true;
            (until, state.rendered.clone())
        };
        let token = self.loads.begin_child(&self.route);

        let request = LoadRequest {
            tref: self.tref.clone(),
            authors: self.authors.clone(),
            page: PageRequest::Older { until },
            known,
        };
        let result = self.engine.load(request, self.sink.as_ref(), &token).await;
        self.apply(&token, &result);
        Some(result.report)
    }

    fn apply(&self, token: &SessionToken, result: &LoadResult) {
        if !token.is_live() {
            return;
        }
        let mut state = self.state.lock();
        state.page_loading = false;
        state.rendered.extend(result.shown.iter().cloned());
        for id in &result.removed {
            state.rendered.remove(id);
        }
        if let Some(cursor) = result.report.cursor {
            state.cursor = Some(state.cursor.map_or(cursor, |c| c.min(cursor)));
        }
        state.newest = state.newest.max(result.newest);
        state.last_report = Some(result.report.clone());
    }

    /// Check relays for events newer than anything in the view.
    ///
    /// New events are held back and announced through
    /// [`TimelineSink::new_events_available`]. Returns the pending count, or
    /// `None` if the check was superseded.
    pub async fn sync_once(&self) -> Option<usize> {
        let token = self.syncs.begin_child(&self.route);

        let (since, known) = {
            let state = self.state.lock();
            let newest = state
                .pending
                .iter()
                .map(|e| e.created_at)
                .max()
                .max(state.newest);
            let since = match (newest, state.loaded_at) {
                (Some(newest), _) => newest + 1,
                (None, Some(loaded_at)) => loaded_at,
                (None, None) => self.engine.store().clock().now_secs().max(0) as u64,
            };
            let mut known = state.rendered.clone();
            known.extend(state.pending.iter().map(|e| (e.id.clone(), e.pubkey.clone())));
            (since, known)
        };

        let request = SyncRequest {
            tref: self.tref.clone(),
            authors: self.authors.clone(),
            since,
            known,
        };
        let result = self.engine.fetch_new(request, &token).await;
        if result.cancelled || !token.is_live() {
            return None;
        }

        let (added, pending) = {
            let mut state = self.state.lock();
            for id in &result.removed {
                state.rendered.remove(id);
            }
            state.pending.retain(|e| !result.removed.contains(&e.id));

            let before = state.pending.len();
            for event in result.events {
                if !state.rendered.contains_key(&event.id)
                    && !state.pending.iter().any(|p| p.id == event.id)
                {
                    state.pending.push(event);
                }
            }
            (state.pending.len() - before, state.pending.len())
        };

        let guarded = GuardedSink::new(self.sink.as_ref(), &token);
        if !result.removed.is_empty() {
            guarded.remove_events(&result.removed);
        }
        if added > 0 {
            metrics::counter!("timeline_sync_new_events_total").increment(added as u64);
            guarded.new_events_available(pending);
        }
        Some(pending)
    }

    /// Render events found by background sync and persist them.
    pub fn show_pending(&self) -> usize {
        let guarded = GuardedSink::new(self.sink.as_ref(), &self.route);
        let mut pending = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending)
        };
        if pending.is_empty() || !guarded.is_live() {
            return 0;
        }
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        if !guarded.render_events(&pending) {
            return 0;
        }
        {
            let mut state = self.state.lock();
            state
                .rendered
                .extend(pending.iter().map(|e| (e.id.clone(), e.pubkey.clone())));
            state.newest = state.newest.max(pending.first().map(|e| e.created_at));
        }

        let batch = TimelineBatch::from_events(&pending);
        let shown = pending.len();
        self.engine
            .event_writer()
            .enqueue_many(pending, self.tref.is_protected());
        self.engine.timeline_writer().prepend(self.tref.clone(), batch);
        guarded.new_events_available(0);
        shown
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn rendered_count(&self) -> usize {
        self.state.lock().rendered.len()
    }

    pub fn cursor(&self) -> Option<u64> {
        self.state.lock().cursor
    }

    pub fn newest(&self) -> Option<u64> {
        self.state.lock().newest
    }

    pub fn last_report(&self) -> Option<LoadReport> {
        self.state.lock().last_report.clone()
    }
}

impl std::fmt::Debug for TimelineView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineView")
            .field("timeline", &self.tref.key())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}
