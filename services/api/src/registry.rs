//! Session Registry
//!
//! The only structure shared between sessions: a lookup table from session id
//! to a read-only view of that session. Entries are inserted when a client
//! connects and removed when its connection closes. The registry never owns
//! session state; each coordinator does.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, distr::Alphanumeric};
use relay_core::session::{SessionId, SessionState};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

const ID_SUFFIX_LEN: usize = 9;

/// Generates a session id from the current time plus a random suffix.
pub fn new_session_id() -> SessionId {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    SessionId::new(format!(
        "session_{}_{}",
        Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    ))
}

/// Non-owning view of a live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub created_at: DateTime<Utc>,
    pub state: watch::Receiver<SessionState>,
}

impl SessionEntry {
    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Returns the entry it replaced, which only happens on an id collision.
    pub fn insert(&self, id: SessionId, entry: SessionEntry) -> Option<SessionEntry> {
        self.sessions.lock().insert(id, entry)
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionEntry> {
        self.sessions.lock().remove(id)
    }

    /// Number of registered sessions in each lifecycle state.
    pub fn state_counts(&self) -> BTreeMap<SessionState, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.sessions.lock().values() {
            *counts.entry(entry.current_state()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entry(state: SessionState) -> (watch::Sender<SessionState>, SessionEntry) {
        let (tx, rx) = watch::channel(state);
        (
            tx,
            SessionEntry {
                created_at: Utc::now(),
                state: rx,
            },
        )
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        let id = new_session_id();
        let (_tx, e) = entry(SessionState::Created);

        assert!(registry.insert(id.clone(), e).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        // Removing twice is harmless.
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_state_counts_follow_sessions() {
        let registry = SessionRegistry::new();
        let (tx, e) = entry(SessionState::Created);
        let (_ready, other) = entry(SessionState::Ready);
        registry.insert(SessionId::new("session_1"), e);
        registry.insert(SessionId::new("session_2"), other);
        assert_eq!(
            registry.state_counts(),
            BTreeMap::from([(SessionState::Created, 1), (SessionState::Ready, 1)])
        );

        tx.send_replace(SessionState::Ready);
        assert_eq!(
            registry.state_counts(),
            BTreeMap::from([(SessionState::Ready, 2)])
        );
    }

    #[test]
    fn test_sessions_are_independent() {
        let registry = SessionRegistry::new();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        let (_ta, ea) = entry(SessionState::Active);
        let (_tb, eb) = entry(SessionState::Created);
        registry.insert(a.clone(), ea);
        registry.insert(b.clone(), eb);

        registry.remove(&a);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.state_counts(),
            BTreeMap::from([(SessionState::Created, 1)])
        );
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 1000);
        let id = new_session_id();
        assert!(id.as_str().starts_with("session_"));
    }
}
