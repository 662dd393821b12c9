// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// Presence timing constants
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

// Worker pool configuration constants
pub const DEFAULT_WORKER_COUNT: usize = 4;
