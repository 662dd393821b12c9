//! Core functionality for the chat engine

pub mod connection;
pub mod engine;
pub mod message;
pub mod presence;
pub mod rooms;
pub mod timer;
pub mod worker_pool;

// Re-export main components for convenience
pub use connection::{ConnectionId, ConnectionIndex, ConnectionSender};
pub use engine::{ConnectionRoomEngine, Directive};
pub use message::{ClientMessage, ServerMessage};
pub use presence::{ConnectionType, PresenceStats, PresenceTracker, Session};
pub use rooms::RoomRegistry;
pub use timer::TimerService;
pub use worker_pool::{TaskHandle, WorkerPool};
