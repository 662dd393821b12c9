//! Connection and room-broadcast engine
//!
//! Owns the per-connection authentication handshake, the user-to-connection
//! index, live room membership and the broadcast fan-out. All shared state
//! is linearized through one mutex; membership is snapshotted under the
//! lock and the per-member sends happen after it is released, so no lock
//! is ever held across a send or a call into the token verifier. Where the
//! presence tracker and the index must agree, presence is locked inside
//! the engine lock, never the other way around.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use warp::ws::Message as WsMessage;

use crate::auth::token::TokenVerifier;
use crate::core::connection::{ConnectionId, ConnectionIndex, ConnectionSender};
use crate::core::message::{ClientMessage, ServerMessage};
use crate::core::presence::{ConnectionType, PresenceStats, PresenceTracker};
use crate::core::rooms::RoomRegistry;
use crate::error::{ChatRelayError, Result};

/// What the transport should do with the connection after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Close,
}

struct EngineState {
    index: ConnectionIndex,
    rooms: RoomRegistry,
    closed: bool,
}

/// The connection/room state machine shared by all transport tasks
pub struct ConnectionRoomEngine {
    state: Mutex<EngineState>,
    presence: Arc<PresenceTracker>,
    verifier: Arc<dyn TokenVerifier + Send + Sync>,
    heartbeat_timeout: Duration,
}

impl ConnectionRoomEngine {
    pub fn new(
        presence: Arc<PresenceTracker>,
        verifier: Arc<dyn TokenVerifier + Send + Sync>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                index: ConnectionIndex::new(),
                rooms: RoomRegistry::new(),
                closed: false,
            }),
            presence,
            verifier,
            heartbeat_timeout,
        }
    }

    /// Track a newly accepted connection in the UNAUTHENTICATED state.
    pub fn register_connection(
        &self,
        conn_id: ConnectionId,
        sender: ConnectionSender,
    ) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(ChatRelayError::ShuttingDown);
        }
        state.index.insert(conn_id, sender);
        info!(
            "Connection {} registered ({} connections open)",
            conn_id,
            state.index.connection_count()
        );
        Ok(())
    }

    /// Process one inbound text frame. The returned directive tells the
    /// transport whether to keep reading or close the socket.
    pub fn handle_message(&self, conn_id: ConnectionId, text: &str) -> Result<Directive> {
        let user_id = {
            let state = self.state.lock()?;
            state.index.user_of(conn_id).cloned()
        };

        let parsed = serde_json::from_str::<ClientMessage>(text);

        match user_id {
            None => match parsed {
                Ok(ClientMessage::Auth { user_id, token }) => {
                    self.handle_auth(conn_id, &user_id, &token)
                }
                Ok(_) => {
                    // Only an auth message is accepted before the handshake
                    self.send_to_connection(
                        conn_id,
                        &ServerMessage::AuthError {
                            message: "Authentication required".to_string(),
                        },
                    )?;
                    Ok(Directive::Close)
                }
                Err(e) => {
                    self.send_to_connection(
                        conn_id,
                        &ServerMessage::AuthError {
                            message: format!("Malformed message: {}", e),
                        },
                    )?;
                    Ok(Directive::Close)
                }
            },
            Some(user_id) => match parsed {
                Ok(ClientMessage::Auth { .. }) => {
                    self.send_to_connection(
                        conn_id,
                        &ServerMessage::Error {
                            message: "Already authenticated".to_string(),
                        },
                    )?;
                    Ok(Directive::Continue)
                }
                Ok(ClientMessage::JoinRoom { room_id }) => {
                    self.handle_join_room(conn_id, &user_id, &room_id)?;
                    Ok(Directive::Continue)
                }
                Ok(ClientMessage::LeaveRoom) => {
                    self.handle_leave_room(conn_id, &user_id)?;
                    Ok(Directive::Continue)
                }
                Ok(ClientMessage::ChatMessage { content }) => {
                    self.handle_chat_message(conn_id, &user_id, content)?;
                    Ok(Directive::Continue)
                }
                Ok(ClientMessage::Ping) => {
                    self.presence.heartbeat(&user_id)?;
                    self.send_to_connection(
                        conn_id,
                        &ServerMessage::Pong {
                            timestamp: ServerMessage::now_millis(),
                        },
                    )?;
                    Ok(Directive::Continue)
                }
                Err(e) => {
                    debug!("Unparseable message from {}: {}", user_id, e);
                    self.send_to_connection(
                        conn_id,
                        &ServerMessage::Error {
                            message: format!("Malformed message: {}", e),
                        },
                    )?;
                    Ok(Directive::Continue)
                }
            },
        }
    }

    /// Authentication handshake. Token verification runs before the state
    /// lock is taken. Every failure mode gets the same structured reply and
    /// a close.
    fn handle_auth(&self, conn_id: ConnectionId, user_id: &str, token: &str) -> Result<Directive> {
        let verified = match self.verifier.verify(token) {
            Ok(subject) if subject == user_id => subject,
            Ok(subject) => {
                warn!(
                    "Token subject {} does not match claimed user {} on {}",
                    subject, user_id, conn_id
                );
                self.send_to_connection(
                    conn_id,
                    &ServerMessage::AuthError {
                        message: "Token does not match user".to_string(),
                    },
                )?;
                return Ok(Directive::Close);
            }
            Err(e) => {
                warn!("Rejected handshake on {}: {}", conn_id, e);
                self.send_to_connection(
                    conn_id,
                    &ServerMessage::AuthError {
                        message: "Invalid or expired token".to_string(),
                    },
                )?;
                return Ok(Directive::Close);
            }
        };

        // Single session per user. The presence replacement and the index
        // rebind form one critical section; a concurrent login for the same
        // user cannot interleave between them, so presence and the index
        // always name the same connection.
        let displaced_sender = {
            let mut state = self.state.lock()?;
            if state.closed {
                return Ok(Directive::Close);
            }
            let displaced = self
                .presence
                .login(&verified, ConnectionType::WebSocket, Some(conn_id))?;
            let displaced_sender = displaced.and_then(|old_conn| {
                let sender = state.index.sender_of(old_conn).cloned();
                state.index.remove(old_conn);
                sender
            });
            state.index.bind(conn_id, verified.clone());
            displaced_sender
        };

        if let Some(sender) = displaced_sender {
            let notice = ServerMessage::Error {
                message: "Logged in from another connection".to_string(),
            };
            let _ = sender.send(WsMessage::text(notice.to_json()));
            let _ = sender.send(WsMessage::close_with(1000u16, "session replaced"));
        }

        info!("User {} authenticated on connection {}", verified, conn_id);
        self.send_to_connection(
            conn_id,
            &ServerMessage::AuthSuccess {
                user_id: verified,
            },
        )?;
        Ok(Directive::Continue)
    }

    fn handle_join_room(&self, conn_id: ConnectionId, user_id: &str, room_id: &str) -> Result<()> {
        // Mutate membership and snapshot both notification targets under
        // one critical section, then send with the lock released.
        let (vacated, old_recipients, new_recipients) = {
            let mut state = self.state.lock()?;
            let vacated = state.rooms.join(user_id, room_id);
            let old_recipients = vacated
                .as_deref()
                .map(|old_room| recipients(&state, old_room, Some(user_id)))
                .unwrap_or_default();
            let new_recipients = recipients(&state, room_id, Some(user_id));
            (vacated, old_recipients, new_recipients)
        };

        if let Some(old_room) = vacated {
            debug!("User {} implicitly left {} for {}", user_id, old_room, room_id);
            fan_out(
                &old_recipients,
                &ServerMessage::UserLeft {
                    user_id: user_id.to_string(),
                    room_id: old_room.clone(),
                    message: format!("{} left the room", user_id),
                },
            );
        }

        self.send_to_connection(
            conn_id,
            &ServerMessage::RoomJoined {
                room_id: room_id.to_string(),
            },
        )?;

        // The joiner is excluded from its own join announcement
        fan_out(
            &new_recipients,
            &ServerMessage::UserJoined {
                user_id: user_id.to_string(),
                room_id: room_id.to_string(),
                message: format!("{} joined the room", user_id),
            },
        );

        info!("User {} joined room {}", user_id, room_id);
        Ok(())
    }

    fn handle_leave_room(&self, conn_id: ConnectionId, user_id: &str) -> Result<()> {
        let (vacated, remaining) = {
            let mut state = self.state.lock()?;
            match state.rooms.leave(user_id) {
                Some(room_id) => {
                    let remaining = recipients(&state, &room_id, Some(user_id));
                    (Some(room_id), remaining)
                }
                None => (None, Vec::new()),
            }
        };

        let Some(room_id) = vacated else {
            // User error, not a silent no-op; the connection stays open
            self.send_to_connection(
                conn_id,
                &ServerMessage::Error {
                    message: "You are not in a room".to_string(),
                },
            )?;
            return Ok(());
        };

        self.send_to_connection(
            conn_id,
            &ServerMessage::RoomLeft {
                room_id: room_id.clone(),
            },
        )?;
        fan_out(
            &remaining,
            &ServerMessage::UserLeft {
                user_id: user_id.to_string(),
                room_id: room_id.clone(),
                message: format!("{} left the room", user_id),
            },
        );

        info!("User {} left room {}", user_id, room_id);
        Ok(())
    }

    /// Broadcast a chat message to every member of the sender's room, the
    /// sender included, with a server-assigned timestamp.
    fn handle_chat_message(
        &self,
        conn_id: ConnectionId,
        user_id: &str,
        content: String,
    ) -> Result<()> {
        let (room_id, members) = {
            let state = self.state.lock()?;
            match state.rooms.room_of(user_id) {
                Some(room_id) => {
                    let room_id = room_id.clone();
                    let members = recipients(&state, &room_id, None);
                    (Some(room_id), members)
                }
                None => (None, Vec::new()),
            }
        };

        let Some(room_id) = room_id else {
            self.send_to_connection(
                conn_id,
                &ServerMessage::Error {
                    message: "Join a room before sending messages".to_string(),
                },
            )?;
            return Ok(());
        };

        let message = ServerMessage::ChatMessage {
            user_id: user_id.to_string(),
            room_id: room_id.clone(),
            content,
            timestamp: ServerMessage::now_millis(),
        };
        let delivered = fan_out(&members, &message);
        debug!(
            "Chat message from {} delivered to {}/{} members of {}",
            user_id,
            delivered,
            members.len(),
            room_id
        );
        Ok(())
    }

    /// Cleanup for a closed connection. Idempotent: repeated close
    /// notifications for an already-cleaned-up connection are no-ops, and
    /// closing an unauthenticated connection only drops its sender.
    pub fn handle_disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        let user_id = {
            let mut state = self.state.lock()?;
            state.index.remove(conn_id)
        };

        let Some(user_id) = user_id else {
            debug!("Connection {} closed before authenticating", conn_id);
            return Ok(());
        };

        // Presence only logs the user out if this connection still owns the
        // session; after a relogin the old close must not evict the user.
        if self.presence.logout_by_connection(conn_id)?.is_none() {
            debug!("Stale close for {} ignored, user {} relogged", conn_id, user_id);
            return Ok(());
        }

        self.evict_from_room(&user_id)?;
        info!("User {} disconnected", user_id);
        Ok(())
    }

    /// Force-log-out every session whose heartbeat has gone stale, with the
    /// same side effects as an explicit disconnect. Runs as a periodic
    /// TimerService task. Returns the number of evicted sessions.
    pub fn sweep_stale(&self) -> Result<usize> {
        let stale = self.presence.stale_users(self.heartbeat_timeout)?;
        let mut evicted = 0;
        for user_id in stale {
            let sender = {
                let mut state = self.state.lock()?;
                // Re-checked under the lock: the user may have heartbeated
                // or re-authenticated since the snapshot was taken.
                let Some(session) = self
                    .presence
                    .logout_if_stale(&user_id, self.heartbeat_timeout)?
                else {
                    continue;
                };
                session.connection.and_then(|conn_id| {
                    let sender = state.index.sender_of(conn_id).cloned();
                    state.index.remove(conn_id);
                    sender
                })
            };
            info!("Heartbeat timeout for user {}, forcing logout", user_id);
            self.evict_from_room(&user_id)?;
            if let Some(sender) = sender {
                let _ = sender.send(WsMessage::close_with(1000u16, "heartbeat timeout"));
            }
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Remove a user from whatever room they occupy and notify the rest.
    fn evict_from_room(&self, user_id: &str) -> Result<()> {
        let (vacated, remaining) = {
            let mut state = self.state.lock()?;
            match state.rooms.leave(user_id) {
                Some(room_id) => {
                    let remaining = recipients(&state, &room_id, Some(user_id));
                    (Some(room_id), remaining)
                }
                None => (None, Vec::new()),
            }
        };
        if let Some(room_id) = vacated {
            fan_out(
                &remaining,
                &ServerMessage::UserLeft {
                    user_id: user_id.to_string(),
                    room_id,
                    message: format!("{} left the room", user_id),
                },
            );
        }
        Ok(())
    }

    /// Stop accepting connections, close every open socket with a
    /// going-away status and clear all state. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let senders = {
            let mut state = self.state.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let senders = state.index.all_senders();
            state.index.clear();
            state.rooms.clear();
            senders
        };
        info!("Engine shutting down, closing {} connections", senders.len());
        for sender in senders {
            let _ = sender.send(WsMessage::close_with(1001u16, "going away"));
        }
        self.presence.clear()?;
        Ok(())
    }

    // --- Query surface consumed by the HTTP layer (read-only) ---

    pub fn online_users(&self) -> Result<Vec<String>> {
        self.presence.online_users()
    }

    pub fn online_users_in_room(&self, room_id: &str) -> Result<Vec<String>> {
        let members = {
            let state = self.state.lock()?;
            state.rooms.members_of(room_id)
        };
        self.presence.online_users_in_room(&members)
    }

    pub fn room_of(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.state.lock()?.rooms.room_of(user_id).cloned())
    }

    pub fn members_of(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.state.lock()?.rooms.members_of(room_id))
    }

    pub fn stats(&self) -> Result<PresenceStats> {
        self.presence.stats()
    }

    pub fn connection_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.index.connection_count())
    }

    /// Refresh the heartbeat of whichever user owns a connection. Used by
    /// the transport for protocol-level pings.
    pub fn touch_connection(&self, conn_id: ConnectionId) -> Result<bool> {
        self.presence.heartbeat_by_connection(conn_id)
    }

    fn send_to_connection(&self, conn_id: ConnectionId, message: &ServerMessage) -> Result<()> {
        let sender = {
            let state = self.state.lock()?;
            state.index.sender_of(conn_id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(WsMessage::text(message.to_json())).is_err() {
                    warn!("Failed to send to connection {}", conn_id);
                }
                Ok(())
            }
            None => Err(ChatRelayError::ConnectionNotFound(conn_id.to_string())),
        }
    }
}

/// Snapshot the senders of a room's members, optionally excluding one user.
/// Must be called with the engine state lock held.
fn recipients(
    state: &EngineState,
    room_id: &str,
    exclude: Option<&str>,
) -> Vec<(String, ConnectionSender)> {
    state
        .rooms
        .members_of(room_id)
        .into_iter()
        .filter(|member| exclude != Some(member.as_str()))
        .filter_map(|member| {
            state
                .index
                .sender_for_user(&member)
                .cloned()
                .map(|sender| (member, sender))
        })
        .collect()
}

/// Send one message independently to each recipient. A failed send is
/// logged and skipped; it never suppresses delivery to the rest.
fn fan_out(recipients: &[(String, ConnectionSender)], message: &ServerMessage) -> usize {
    let encoded = message.to_json();
    let mut delivered = 0;
    for (member, sender) in recipients {
        if sender.send(WsMessage::text(encoded.clone())).is_ok() {
            delivered += 1;
        } else {
            warn!("Failed to deliver message to {}", member);
        }
    }
    delivered
}
