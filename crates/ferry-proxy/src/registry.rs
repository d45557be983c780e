//! In-memory registry of live relay sessions.

use std::collections::HashMap;
use std::sync::Arc;

use ferry_relay::Session;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Thread-safe registry of sessions the proxy has accepted and not yet
/// torn down.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session under its id.
    pub async fn register(&self, session: Arc<Session>) {
        let id = session.id();
        self.sessions.write().await.insert(id, session);
        debug!(session_id = %id, "Session registered");
    }

    /// Stop tracking a session.
    pub async fn unregister(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(&id);
        if session.is_some() {
            debug!(session_id = %id, "Session unregistered");
        } else {
            warn!(session_id = %id, "Tried to unregister unknown session");
        }
        session
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Ids of every tracked session.
    pub async fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Stop every tracked session. Returns how many were stopped.
    ///
    /// Sessions stay registered until their own tasks unregister them.
    pub async fn stop_all(&self) -> usize {
        // No lock is held across `stop`.
        let mut stopped = 0;
        for id in self.ids().await {
            if let Some(session) = self.get(id).await {
                session.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(count = stopped, "Stopped all sessions");
        }
        stopped
    }
}
