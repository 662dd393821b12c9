//! Wire message types exchanged with chat clients

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Client-to-server message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Authentication handshake, must be the first message on a connection
    #[serde(rename = "auth")]
    Auth { user_id: String, token: String },

    /// Join a room (implicitly leaves the current room, if any)
    #[serde(rename = "join_room")]
    JoinRoom { room_id: String },

    /// Leave the current room
    #[serde(rename = "leave_room")]
    LeaveRoom,

    /// Send a chat message to the current room
    #[serde(rename = "chat_message")]
    ChatMessage { content: String },

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping,
}

/// Server-to-client message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake accepted
    #[serde(rename = "auth_success")]
    AuthSuccess { user_id: String },

    /// Handshake rejected; the connection is closed after this message
    #[serde(rename = "auth_error")]
    AuthError { message: String },

    /// Join confirmation for the joining user
    #[serde(rename = "room_joined")]
    RoomJoined { room_id: String },

    /// Leave confirmation for the leaving user
    #[serde(rename = "room_left")]
    RoomLeft { room_id: String },

    /// Another user joined the room
    #[serde(rename = "user_joined")]
    UserJoined {
        user_id: String,
        room_id: String,
        message: String,
    },

    /// Another user left the room
    #[serde(rename = "user_left")]
    UserLeft {
        user_id: String,
        room_id: String,
        message: String,
    },

    /// Chat message fanned out to every room member, the sender included
    #[serde(rename = "chat_message")]
    ChatMessage {
        user_id: String,
        room_id: String,
        content: String,
        timestamp: i64,
    },

    /// Heartbeat reply
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Recoverable user error; the connection stays open
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Server-assigned timestamp for outbound messages (UTC milliseconds)
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Encode for the wire. Serialization of these enums cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
