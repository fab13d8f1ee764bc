//! Live session registry
//!
//! Tracks authenticated sessions per protocol and cancels all of them on
//! shutdown.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::protocol::ProtocolKind;

/// Unique session identifier
pub type SessionId = u64;

/// Registry of live sessions
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    /// Counter for generating unique session IDs
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, ProtocolKind>>,
    /// Parent of every session token
    shutdown: CancellationToken,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`cancel_all`](Self::cancel_all). Connections that
    /// are not registered yet derive from it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register a session and return its ID and cancellation token.
    /// After shutdown the token comes back already cancelled.
    pub fn register(&self, protocol: ProtocolKind) -> (SessionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, protocol);
        (id, self.shutdown.child_token())
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Cancel every session, including ones still handshaking.
    /// Returns the number of registered sessions at that moment.
    pub fn cancel_all(&self) -> usize {
        self.shutdown.cancel();
        self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_by_protocol(&self, protocol: ProtocolKind) -> usize {
        self.sessions.iter().filter(|s| *s.value() == protocol).count()
    }
}
