//! Connection handles and the user-to-connection index

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::Message as WsMessage;

/// Opaque, comparable, hashable token identifying one live transport session.
/// The transport layer owns the underlying socket; this handle carries no
/// ownership semantics of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection send handle. Pushes never block; a closed receiver
/// surfaces as a send error at the call site.
pub type ConnectionSender = mpsc::UnboundedSender<WsMessage>;

/// Bidirectional user-to-connection mapping plus the sender for each live
/// connection. All three maps are mutated in lock-step; callers provide
/// the surrounding lock.
#[derive(Default)]
pub struct ConnectionIndex {
    senders: HashMap<ConnectionId, ConnectionSender>,
    conn_user: HashMap<ConnectionId, String>,
    user_conn: HashMap<String, ConnectionId>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted, still unauthenticated connection.
    pub fn insert(&mut self, conn_id: ConnectionId, sender: ConnectionSender) {
        self.senders.insert(conn_id, sender);
    }

    /// Bind an authenticated user to a connection, both directions at once.
    pub fn bind(&mut self, conn_id: ConnectionId, user_id: String) {
        self.conn_user.insert(conn_id, user_id.clone());
        self.user_conn.insert(user_id, conn_id);
    }

    /// Drop a connection entirely. Returns the user it was bound to, if any.
    /// Both directions of the index go together, so a later lookup can never
    /// see half the mapping.
    pub fn remove(&mut self, conn_id: ConnectionId) -> Option<String> {
        self.senders.remove(&conn_id);
        let user_id = self.conn_user.remove(&conn_id);
        if let Some(ref uid) = user_id {
            // Only clear the reverse entry if it still points at this
            // connection; a relogin may already have rebound the user.
            if self.user_conn.get(uid) == Some(&conn_id) {
                self.user_conn.remove(uid);
            }
        }
        user_id
    }

    pub fn sender_of(&self, conn_id: ConnectionId) -> Option<&ConnectionSender> {
        self.senders.get(&conn_id)
    }

    pub fn user_of(&self, conn_id: ConnectionId) -> Option<&String> {
        self.conn_user.get(&conn_id)
    }

    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.user_conn.get(user_id).copied()
    }

    /// Sender for a user's current connection, if online over WebSocket.
    pub fn sender_for_user(&self, user_id: &str) -> Option<&ConnectionSender> {
        self.connection_of(user_id)
            .and_then(|conn_id| self.senders.get(&conn_id))
    }

    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }

    /// All live senders, for shutdown fan-out.
    pub fn all_senders(&self) -> Vec<ConnectionSender> {
        self.senders.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.senders.clear();
        self.conn_user.clear();
        self.user_conn.clear();
    }
}
