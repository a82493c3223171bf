use std::time::{Duration, Instant};

/// ICMP error notices allowed per window.
pub const NOTICES_PER_WINDOW: u32 = 10;

/// Length of a rate-limiting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window limiter for generated ICMP error notices.
///
/// The window is reset lazily on the first use after it ends.
#[derive(Debug)]
pub struct RateLimiter {
    window_start: Option<Instant>,
    count_in_window: u32,
    limit: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(NOTICES_PER_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            window_start: None,
            count_in_window: 0,
            limit,
            window: WINDOW,
        }
    }

    /// Take one slot in the current window, if any is left.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= self.window,
            None => true,
        };
        if expired {
            self.window_start = Some(now);
            self.count_in_window = 0;
        }

        if self.count_in_window >= self.limit {
            return false;
        }
        self.count_in_window += 1;
        true
    }
}
