//! Per-connection token bucket.

use std::time::{Duration, Instant};

/// Default burst size, in messages.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 200;
/// Default sustained rate, in messages per second.
pub const DEFAULT_RATE_LIMIT_SUSTAINED: u32 = 50;
/// Longest retry hint handed to a client.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(10);

/// Token bucket guarding one WebSocket connection.
///
/// Holds up to `burst` permits and regains `per_second` permits each second.
#[derive(Debug)]
pub struct RateLimiter {
    available: f64,
    burst: f64,
    per_second: f64,
    checked_at: Instant,
}

impl RateLimiter {
    /// Create a full bucket.
    #[must_use]
    pub fn new(burst: u32, per_second: u32) -> Self {
        Self {
            available: f64::from(burst),
            burst: f64::from(burst),
            per_second: f64::from(per_second),
            checked_at: Instant::now(),
        }
    }

    /// Take one permit.
    ///
    /// # Errors
    ///
    /// Returns how long to wait before a permit is available, capped at
    /// [`MAX_RETRY_HINT`].
    pub fn check(&mut self) -> Result<(), Duration> {
        self.top_up(Instant::now());
        if self.available >= 1.0 {
            self.available -= 1.0;
            return Ok(());
        }
        if self.per_second <= 0.0 {
            return Err(MAX_RETRY_HINT);
        }
        let wait = Duration::from_secs_f64((1.0 - self.available) / self.per_second);
        Err(wait.min(MAX_RETRY_HINT))
    }

    fn top_up(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.checked_at).as_secs_f64();
        self.available = (self.available + elapsed * self.per_second).min(self.burst);
        self.checked_at = now;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_SUSTAINED)
    }
}
