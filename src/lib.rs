//! chat-relay - a real-time room-based chat backend engine
//!
//! Clients connect over WebSocket, authenticate once with a bearer token,
//! join named rooms and exchange messages fanned out to every current
//! room member.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::*;
pub use constants::*;
