use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum ChatRelayError {
    // Protocol errors
    MessageParseError(String),
    UnexpectedMessage(String),

    // Auth errors
    AuthError(String),

    // State errors
    NotInRoom,
    SessionNotFound(String),
    ConnectionNotFound(String),

    // Connection errors
    ConnectionClosed,

    // Worker pool / timer errors
    PoolClosed,
    ShuttingDown,

    // System errors
    LockPoisoned(String),
    SystemError(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for ChatRelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            Self::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Self::NotInRoom => write!(f, "Not currently in a room"),
            Self::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            Self::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::PoolClosed => write!(f, "Worker pool is closed"),
            Self::ShuttingDown => write!(f, "Service is shutting down"),
            Self::LockPoisoned(msg) => write!(f, "Lock poisoned: {}", msg),
            Self::SystemError(msg) => write!(f, "System error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ChatRelayError {}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for ChatRelayError {
    fn from(err: PoisonError<T>) -> Self {
        ChatRelayError::LockPoisoned(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for chat-relay
pub type Result<T> = std::result::Result<T, ChatRelayError>;
