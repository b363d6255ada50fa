//! Per-job bandwidth throttle
//!
//! The budget is split into 100 ms windows of `max(1, rate / 10)` bytes.
//! Every time a full window's worth of bytes has been received, the caller
//! sleeps for whatever is left of that window. When the window already took
//! longer than its budget nothing is slept, the transfer is behind anyway.
//! A trailing partial window is paid for by [`RateLimiter::finish`].

use std::time::Duration;
use tokio::time::Instant;

/// Length of one budget window
pub const WINDOW: Duration = Duration::from_millis(100);

/// Window-based rate limiter for a single transfer
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes allowed per window (0 = unlimited)
    budget: u64,
    /// Bytes received in the current window
    window_bytes: u64,
    window_start: Instant,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_second`; 0 means unlimited
    pub fn new(bytes_per_second: u64) -> Self {
        if bytes_per_second == 0 {
            return Self::unlimited();
        }

        Self {
            budget: (bytes_per_second / 10).max(1),
            window_bytes: 0,
            window_start: Instant::now(),
        }
    }

    /// Create an unlimited limiter (no throttling)
    pub fn unlimited() -> Self {
        Self {
            budget: 0,
            window_bytes: 0,
            window_start: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.budget == 0
    }

    /// Largest piece the caller should write before calling `consume`
    pub fn chunk_size(&self) -> usize {
        if self.is_unlimited() {
            usize::MAX
        } else {
            self.budget as usize
        }
    }

    /// How long to pause after a window of `window_bytes` took `elapsed`
    fn delay_for(&self, elapsed: Duration) -> Option<Duration> {
        let target = WINDOW.mul_f64(self.window_bytes as f64 / self.budget as f64);
        target.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Account for `bytes` just received, sleeping if ahead of the budget
    pub async fn consume(&mut self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }

        self.window_bytes += bytes;
        if self.window_bytes < self.budget {
            return;
        }

        if let Some(delay) = self.delay_for(self.window_start.elapsed()) {
            tokio::time::sleep(delay).await;
        }
        self.window_start = Instant::now();
        self.window_bytes -= self.budget;
    }

    /// Sleep off the last, partially filled window
    pub async fn finish(&mut self) {
        if self.is_unlimited() || self.window_bytes == 0 {
            return;
        }

        if let Some(delay) = self.delay_for(self.window_start.elapsed()) {
            tokio::time::sleep(delay).await;
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
    }
}
