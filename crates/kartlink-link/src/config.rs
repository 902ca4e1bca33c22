//! Link configuration and defaults.

use std::time::Duration;

/// Default serial speed of the tracker radio.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How long a command waits for its acknowledgment before being re-sent.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Telemetry silence after which the link is reported as down.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How long one idle read waits before the IO loop checks for writes again.
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of retries before a command is declared failed.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Broadcast channel capacity for telemetry, acks and events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Size of the buffer handed to each transport read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// How many times an unacknowledged command is re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Retry at most `n` times after the first attempt.
    pub fn bounded(n: u32) -> Self {
        Self {
            max_retries: Some(n),
        }
    }

    /// Retry until acknowledged.
    pub fn unbounded() -> Self {
        Self { max_retries: None }
    }

    /// Whether another retry is allowed after `retries_sent` retries.
    pub fn allows(&self, retries_sent: u32) -> bool {
        self.max_retries.is_none_or(|max| retries_sent < max)
    }
}

/// Bounded at [`DEFAULT_MAX_RETRIES`], unlike the protocol's unbounded
/// re-sending.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_RETRIES)
    }
}

/// Settings for one duplex session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub baud_rate: u32,
    pub read_poll_interval: Duration,
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }
}

/// Complete link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub session: SessionConfig,
    pub ack_timeout: Duration,
    pub retry: RetryPolicy,
    pub liveness_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry: RetryPolicy::default(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
