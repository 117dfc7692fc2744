//! Engine tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and sizing knobs for an [`Engine`](crate::Engine).
///
/// The defaults suit devices on a local network: the worker polls the
/// stream every millisecond and `close` waits 40ms for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the worker's poll timer.
    pub poll_interval_ms: u64,
    /// How long a single poll may wait for bytes.
    pub read_deadline_ms: u64,
    /// How long `close` waits for the worker to acknowledge.
    pub close_grace_ms: u64,
    /// How many times `dial` sends the ping command. Every one must succeed.
    pub ping_attempts: u32,
    /// Largest read performed per poll.
    pub read_chunk: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            read_deadline_ms: 1,
            close_grace_ms: 40,
            ping_attempts: 3,
            read_chunk: 1024,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline_ms = duration_ms(deadline);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = duration_ms(grace);
        self
    }

    pub fn with_ping_attempts(mut self, attempts: u32) -> Self {
        self.ping_attempts = attempts;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
