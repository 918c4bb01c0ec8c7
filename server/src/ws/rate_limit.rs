use std::time::Duration;
use tokio::time::Instant;

/// Fixed-window message counter, owned by one connection's read loop.
///
/// The window opens on the first message after the previous one expired and
/// admits `limit` messages until `window` has elapsed.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Count one message. Returns false if the current window is exhausted.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= self.limit {
            return false;
        }
        self.count += 1;
        true
    }

    /// Messages still allowed in the current window.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}
