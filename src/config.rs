//! Server configuration module
//! Handles dynamic configuration parameters for the chat engine

use crate::constants::{
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SWEEP_INTERVAL_SECS,
    DEFAULT_WORKER_COUNT,
};
use crate::error::{ChatRelayError, Result};
use std::env;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum allowed silence from a connection before it is treated as gone
    pub heartbeat_timeout: Duration,
    /// How often the presence sweep runs
    pub sweep_interval: Duration,
    /// Number of worker threads in the general-purpose worker pool
    pub worker_count: usize,
    /// JWT secret for token validation
    pub jwt_secret: String,
}

impl ServerConfig {
    /// Create a test configuration with short timeouts. Only for testing.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
            worker_count: 2,
            jwt_secret: "unit-test-jwt-secret-never-use-in-production".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = env::var("CHAT_RELAY_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env::var("CHAT_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let heartbeat_secs = env::var("CHAT_RELAY_HEARTBEAT_TIMEOUT")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS);

        let sweep_secs = env::var("CHAT_RELAY_SWEEP_INTERVAL")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        let worker_count = env::var("CHAT_RELAY_WORKER_COUNT")
            .ok()
            .and_then(|w| w.parse().ok())
            .unwrap_or(DEFAULT_WORKER_COUNT);

        let jwt_secret = env::var("CHAT_RELAY_JWT_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .map_err(|_| {
                ChatRelayError::ConfigError(
                    "JWT_SECRET environment variable is required. \
                     Generate one with: openssl rand -base64 32"
                        .to_string(),
                )
            })?;

        if jwt_secret.len() < 32 {
            return Err(ChatRelayError::ConfigError(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        Ok(Self {
            host,
            port,
            heartbeat_timeout: Duration::from_secs(heartbeat_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            worker_count,
            jwt_secret,
        })
    }
}
