//! # Session Registry
//!
//! Tracks the sessions a server accepted, keyed by `SessionId`.
//!
//! Uses DashMap for concurrent access without a global lock: the accept loop
//! registers while connection tasks deregister, and neither waits on the other.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::session::Session;
use crate::session::SessionId;

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `session`. Returns false if it was already registered.
    pub fn register(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        let fresh = self.sessions.insert(id, session).is_none();
        if fresh {
            debug!(session = %id, live = self.sessions.len(), "session registered");
        }
        fresh
    }

    /// Removes the session with `id`, if present. Idempotent.
    pub fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(session = %id, live = self.sessions.len(), "session deregistered");
        }
        removed
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Calls `f` on each registered session.
    ///
    /// Runs over a snapshot, so `f` may close sessions (and thereby
    /// deregister them) without deadlocking the map.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for session in self.sessions() {
            f(&session);
        }
    }

    /// Closes every registered session and removes it.
    ///
    /// Only sessions that were closed are removed, so one registered
    /// concurrently is left in place rather than dropped while still open.
    pub fn shutdown(&self) {
        self.for_each(|session| {
            session.close();
            self.sessions.remove(&session.id());
        });
    }
}
