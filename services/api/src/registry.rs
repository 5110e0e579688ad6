//! Process-wide map from stream identifier to live call session.

use crate::ws::session::SessionControl;
use callbridge_core::CloseReason;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionControl>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under its stream identifier.
    pub fn insert(&self, stream_sid: &str, session: Arc<SessionControl>) {
        if let Some(previous) = self.sessions.insert(stream_sid.to_string(), session) {
            warn!(
                stream_sid,
                previous = %previous.session_id(),
                "Stream identifier reused, replacing registered session"
            );
        }
    }

    /// Removes the entry only if it still belongs to `session_id`.
    pub fn remove(&self, stream_sid: &str, session_id: Uuid) -> bool {
        self.sessions
            .remove_if(stream_sid, |_, s| s.session_id() == session_id)
            .is_some()
    }

    pub fn get(&self, stream_sid: &str) -> Option<Arc<SessionControl>> {
        self.sessions.get(stream_sid).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every registered session. Returns how many were closed here.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        // Collect first: closing removes entries, which must not happen
        // while a shard lock is held.
        let sessions: Vec<Arc<SessionControl>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions
            .into_iter()
            .filter(|s| s.close(reason, None))
            .count()
    }
}
