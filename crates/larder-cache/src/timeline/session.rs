//! Liveness tokens for load sessions.
//!
//! A [`SessionRegistry`] is a slot that holds at most one live session.
//! Beginning a new session in the slot supersedes the previous one; a token
//! can also hang off a parent so that navigating away kills every load the
//! route started.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A slot whose latest session is the only live one.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session, superseding whatever was live in this slot.
    pub fn begin(&self) -> SessionToken {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        SessionToken {
            generation,
            slot: Arc::clone(&self.generation),
            parent: None,
        }
    }

    /// Like [`begin`](Self::begin), but the session also dies with `parent`.
    pub fn begin_child(&self, parent: &SessionToken) -> SessionToken {
        let mut token = self.begin();
        token.parent = Some(Arc::new(parent.clone()));
        token
    }

    /// Kill the live session without starting another.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Checked before every observable effect of a session.
#[derive(Debug, Clone)]
pub struct SessionToken {
    generation: u64,
    slot: Arc<AtomicU64>,
    parent: Option<Arc<SessionToken>>,
}

impl SessionToken {
    pub fn is_live(&self) -> bool {
        self.slot.load(Ordering::SeqCst) == self.generation
            && self.parent.as_ref().is_none_or(|p| p.is_live())
    }

    /// A token that is never superseded (CLI one-shots, tests).
    pub fn detached() -> Self {
        SessionRegistry::new().begin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_session_supersedes() {
        let slot = SessionRegistry::new();
        let first = slot.begin();
        assert!(first.is_live());

        let second = slot.begin();
        assert!(!first.is_live());
        assert!(second.is_live());

        slot.cancel();
        assert!(!second.is_live());
    }

    #[test]
    fn test_child_dies_with_parent() {
        let routes = SessionRegistry::new();
        let loads = SessionRegistry::new();

        let route = routes.begin();
        let load = loads.begin_child(&route);
        assert!(load.is_live());

        routes.begin();
        assert!(!load.is_live());
    }

    #[test]
    fn test_sibling_slots_are_independent() {
        let route = SessionToken::detached();
        let loads = SessionRegistry::new();
        let syncs = SessionRegistry::new();

        let load = loads.begin_child(&route);
        let sync = syncs.begin_child(&route);
        syncs.begin_child(&route);

        assert!(load.is_live());
        assert!(!sync.is_live());
    }
}
