//! Presence tracking
//!
//! Single source of truth for "who is online, since when, via what
//! transport". The engine drives login/logout side effects; presence never
//! calls back into the engine.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;

use crate::core::connection::ConnectionId;
use crate::error::Result;

/// Transport a session is connected through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    WebSocket,
    Http,
}

/// The record of one currently-online user
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub connection_type: ConnectionType,
    /// Live socket handle; None for HTTP-polling sessions
    pub connection: Option<ConnectionId>,
    pub login_time: Instant,
    pub last_heartbeat: Instant,
}

impl Session {
    fn new(user_id: String, connection_type: ConnectionType, connection: Option<ConnectionId>) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            connection_type,
            connection,
            login_time: now,
            last_heartbeat: now,
        }
    }
}

/// Aggregate presence counters
#[derive(Debug, Clone, Serialize)]
pub struct PresenceStats {
    pub total: usize,
    pub websocket: usize,
    pub http: usize,
}

#[derive(Default)]
struct PresenceState {
    /// user_id -> session; exactly one session per online user
    sessions: HashMap<String, Session>,
    /// connection handle -> user_id, websocket sessions only
    connections: HashMap<ConnectionId, String>,
}

/// Tracks online users and their heartbeat freshness
#[derive(Default)]
pub struct PresenceTracker {
    state: Mutex<PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a login. A login for a user that is already online replaces
    /// the prior session; the displaced WebSocket connection handle (if any
    /// and different from the new one) is returned so the caller can close
    /// it.
    pub fn login(
        &self,
        user_id: &str,
        connection_type: ConnectionType,
        connection: Option<ConnectionId>,
    ) -> Result<Option<ConnectionId>> {
        let mut state = self.state.lock()?;

        let displaced = state
            .sessions
            .remove(user_id)
            .and_then(|old| old.connection)
            .filter(|old_conn| Some(*old_conn) != connection);
        if let Some(old_conn) = displaced {
            state.connections.remove(&old_conn);
            info!("User {} logged in again, displacing connection {}", user_id, old_conn);
        }

        if let Some(conn) = connection {
            state.connections.insert(conn, user_id.to_string());
        }
        state.sessions.insert(
            user_id.to_string(),
            Session::new(user_id.to_string(), connection_type, connection),
        );
        debug!("User {} logged in ({:?})", user_id, connection_type);
        Ok(displaced)
    }

    /// Remove a session. Returns false if the user was not online.
    pub fn logout(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock()?;
        match state.sessions.remove(user_id) {
            Some(session) => {
                if let Some(conn) = session.connection {
                    state.connections.remove(&conn);
                }
                debug!("User {} logged out", user_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the session bound to a closing connection. Returns the user
    /// that owned it, if any.
    pub fn logout_by_connection(&self, connection: ConnectionId) -> Result<Option<String>> {
        let mut state = self.state.lock()?;
        let Some(user_id) = state.connections.remove(&connection) else {
            return Ok(None);
        };
        // Only drop the session if it still belongs to this connection
        if state
            .sessions
            .get(&user_id)
            .map_or(false, |s| s.connection == Some(connection))
        {
            state.sessions.remove(&user_id);
            debug!("User {} logged out (connection {} closed)", user_id, connection);
            return Ok(Some(user_id));
        }
        Ok(None)
    }

    /// Remove a session only if its heartbeat is still older than the
    /// timeout, so a user who came back since the caller's staleness
    /// snapshot is left alone. Returns the removed session, carrying the
    /// connection handle the caller should close.
    pub fn logout_if_stale(&self, user_id: &str, timeout: Duration) -> Result<Option<Session>> {
        let mut state = self.state.lock()?;
        let still_stale = state
            .sessions
            .get(user_id)
            .map_or(false, |s| s.last_heartbeat.elapsed() > timeout);
        if !still_stale {
            return Ok(None);
        }
        let session = state.sessions.remove(user_id);
        if let Some(session) = &session {
            if let Some(conn) = session.connection {
                state.connections.remove(&conn);
            }
            debug!("User {} logged out (heartbeat stale)", user_id);
        }
        Ok(session)
    }

    /// Refresh the last-heartbeat time. Returns false for offline users.
    pub fn heartbeat(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock()?;
        match state.sessions.get_mut(user_id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh the heartbeat of whichever user owns a connection.
    pub fn heartbeat_by_connection(&self, connection: ConnectionId) -> Result<bool> {
        let mut state = self.state.lock()?;
        let Some(user_id) = state.connections.get(&connection).cloned() else {
            return Ok(false);
        };
        if let Some(session) = state.sessions.get_mut(&user_id) {
            session.last_heartbeat = Instant::now();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_online(&self, user_id: &str) -> Result<bool> {
        Ok(self.state.lock()?.sessions.contains_key(user_id))
    }

    pub fn online_users(&self) -> Result<Vec<String>> {
        Ok(self.state.lock()?.sessions.keys().cloned().collect())
    }

    /// Filter a caller-supplied room membership list down to online users.
    pub fn online_users_in_room(&self, members: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock()?;
        Ok(members
            .iter()
            .filter(|m| state.sessions.contains_key(*m))
            .cloned()
            .collect())
    }

    pub fn session_of(&self, user_id: &str) -> Result<Option<Session>> {
        Ok(self.state.lock()?.sessions.get(user_id).cloned())
    }

    pub fn online_duration(&self, user_id: &str) -> Result<Option<Duration>> {
        Ok(self
            .state
            .lock()?
            .sessions
            .get(user_id)
            .map(|s| s.login_time.elapsed()))
    }

    pub fn user_by_connection(&self, connection: ConnectionId) -> Result<Option<String>> {
        Ok(self.state.lock()?.connections.get(&connection).cloned())
    }

    pub fn stats(&self) -> Result<PresenceStats> {
        let state = self.state.lock()?;
        let websocket = state
            .sessions
            .values()
            .filter(|s| s.connection_type == ConnectionType::WebSocket)
            .count();
        Ok(PresenceStats {
            total: state.sessions.len(),
            websocket,
            http: state.sessions.len() - websocket,
        })
    }

    /// Users whose heartbeat age exceeds the timeout. The engine evicts
    /// them with the same side effects as an explicit logout.
    pub fn stale_users(&self, timeout: Duration) -> Result<Vec<String>> {
        let state = self.state.lock()?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.last_heartbeat.elapsed() > timeout)
            .map(|s| s.user_id.clone())
            .collect())
    }

    /// Drop every session. Used on engine shutdown.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.sessions.clear();
        state.connections.clear();
        Ok(())
    }
}
