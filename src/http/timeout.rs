//! Per-request timeout configuration.
//!
//! - **connection_request**: waiting for a free slot in the connection pool
//! - **connect**: establishing the TCP connection, shared by every resolved address
//! - **socket**: maximum gap between packets while reading or writing
//!
//! A zero duration leaves that phase unbounded.

use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub connection_request: Duration,
    pub connect: Duration,
    pub socket: Duration,
}

impl TimeoutPolicy {
    pub fn new(connection_request: Duration, connect: Duration, socket: Duration) -> Self {
        Self {
            connection_request,
            connect,
            socket,
        }
    }

    /// Same bound for all three phases.
    pub fn from_millis(millis: u64) -> Self {
        let d = Duration::from_millis(millis);
        Self::new(d, d, d)
    }

    pub fn with_connection_request(mut self, timeout: Duration) -> Self {
        self.connection_request = timeout;
        self
    }

    pub fn with_connect(mut self, timeout: Duration) -> Self {
        self.connect = timeout;
        self
    }

    pub fn with_socket(mut self, timeout: Duration) -> Self {
        self.socket = timeout;
        self
    }

    pub(crate) fn bounded(timeout: Duration) -> Option<Duration> {
        (!timeout.is_zero()).then_some(timeout)
    }

    /// Instant at which `timeout` expires, `None` when it is zero or too large
    /// to represent.
    pub(crate) fn deadline(timeout: Duration) -> Option<Instant> {
        Self::bounded(timeout).and_then(|t| Instant::now().checked_add(t))
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }
}
