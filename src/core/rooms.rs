//! Live room membership tracking
//!
//! Rooms here are memory-resident broadcast groups, not the persisted room
//! catalog: entries appear on first join and disappear with the last member.

use std::collections::{HashMap, HashSet};

/// Room-to-members map plus its inverse. A user is a member of at most one
/// room at a time; joining a new room implicitly leaves the previous one.
/// Pure data structure; the engine supplies the surrounding lock.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, HashSet<String>>,
    user_room: HashMap<String, String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to a room, creating the room lazily. Returns the room the
    /// user implicitly left, if any, so the caller can notify it.
    pub fn join(&mut self, user_id: &str, room_id: &str) -> Option<String> {
        let previous = self.leave(user_id);
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        self.user_room
            .insert(user_id.to_string(), room_id.to_string());
        previous
    }

    /// Remove a user from their current room. Returns the vacated room id,
    /// or None if the user was not in any room. Empty rooms are dropped.
    pub fn leave(&mut self, user_id: &str) -> Option<String> {
        let room_id = self.user_room.remove(user_id)?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(user_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }

    pub fn room_of(&self, user_id: &str) -> Option<&String> {
        self.user_room.get(user_id)
    }

    /// Membership snapshot for broadcast iteration.
    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
        self.user_room.clear();
    }
}
