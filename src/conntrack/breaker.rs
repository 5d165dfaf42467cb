//! Throughput circuit breaker.
//!
//! Gates how many netlink messages the consumer is willing to process per
//! second. The consumer feeds every received batch through [`tick`], and
//! once a one-second window exceeds the ceiling the breaker opens; the
//! caller is then expected to throttle the socket and [`reset`] on success.
//!
//! [`tick`]: CircuitBreaker::tick
//! [`reset`]: CircuitBreaker::reset

use std::time::{Duration, Instant};

const OBSERVATION_WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window message rate gate. Owned exclusively by the consumer's
/// worker thread; no internal synchronization.
pub struct CircuitBreaker {
    /// Maximum messages per observation window before the breaker opens.
    limit: u64,
    window_start: Instant,
    count: u64,
    open: bool,
}

impl CircuitBreaker {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            count: 0,
            open: false,
        }
    }

    /// Record that `n` messages were just processed. Opens the breaker as
    /// soon as the current window's total crosses the ceiling; an open
    /// breaker stays open until [`reset`](Self::reset).
    pub fn tick(&mut self, n: usize) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= OBSERVATION_WINDOW {
            self.window_start = now;
            self.count = 0;
        }

        self.count += n as u64;
        if self.count > self.limit {
            self.open = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Clear accumulated state after a successful throttle.
    pub fn reset(&mut self) {
        self.window_start = Instant::now();
        self.count = 0;
        self.open = false;
    }
}
