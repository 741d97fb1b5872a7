use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window counter limiting how many signals a client may send.
///
/// The window opens on the first send after the previous window expired;
/// the counter resets at the window boundary rather than refilling
/// gradually.
#[derive(Debug, Clone)]
pub struct SignalRateLimiter {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

/// Read-only view of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u32,
    pub limit: u32,
    pub exhausted: bool,
}

impl SignalRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.roll(now);
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> WindowSnapshot {
        let count = if self.expired(now) { 0 } else { self.count };
        WindowSnapshot {
            count,
            limit: self.limit,
            exhausted: count >= self.limit,
        }
    }

    pub fn reset(&mut self) {
        self.window_start = Instant::now();
        self.count = 0;
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    fn roll(&mut self, now: Instant) {
        if self.expired(now) {
            self.window_start = now;
            self.count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_limiter_allows_up_to_limit() {
        let mut limiter = SignalRateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        assert!(limiter.snapshot().exhausted);
        assert_eq!(limiter.snapshot().count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_resets_at_window_boundary() {
        let mut limiter = SignalRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.snapshot().count, 0);
        assert!(!limiter.snapshot().exhausted);
        assert!(limiter.try_acquire());
        assert_eq!(limiter.snapshot().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_gradual_refill() {
        let mut limiter = SignalRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!limiter.try_acquire());
    }
}
