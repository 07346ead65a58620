//! Session table with per-peer uniqueness.

use crate::session::Session;
use crate::{NodeId, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Concurrent session table. At most one session exists per peer node id;
/// establishing a new one closes and replaces the old.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    by_peer: DashMap<NodeId, SessionId>,
}

impl SessionManager {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, enforcing the one-session-per-peer invariant.
    pub async fn insert(&self, session: Session) -> Arc<Mutex<Session>> {
        let session_id = session.session_id();
        let peer = session.peer_node_id();

        if let Some((_, old_id)) = self.by_peer.remove(&peer) {
            if old_id != session_id {
                if let Some((_, old)) = self.sessions.remove(&old_id) {
                    old.lock().await.close();
                    tracing::debug!(
                        old = %hex::encode(old_id),
                        new = %hex::encode(session_id),
                        "replaced existing session for peer"
                    );
                }
            }
        }

        let shared = Arc::new(Mutex::new(session));
        self.sessions.insert(session_id, Arc::clone(&shared));
        self.by_peer.insert(peer, session_id);
        shared
    }

    /// Look up by session id.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Look up by peer node id.
    #[must_use]
    pub fn get_by_peer(&self, peer: &NodeId) -> Option<Arc<Mutex<Session>>> {
        let id = *self.by_peer.get(peer)?;
        self.get(&id)
    }

    /// Close and remove one session.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                let mut guard = session.lock().await;
                self.by_peer.remove(&guard.peer_node_id());
                guard.close();
                true
            }
            None => false,
        }
    }

    /// Close and remove every session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Sessions currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session ids currently tracked.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }
}
