use std::time::Duration;

pub const LOG_LEVEL: &str = "info";

/// How long to wait for a slave's reply before retrying.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Retries after the initial attempt.
pub const MAX_RETRIES: u32 = 3;

/// Uniform range the pre-retry backoff delay is drawn from.
pub const BACKOFF_MIN: Duration = Duration::from_millis(10);
pub const BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Consecutive I/O failures after which the bus is considered dead.
pub const FATAL_IO_THRESHOLD: u32 = 5;

/// Control loop tick.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
