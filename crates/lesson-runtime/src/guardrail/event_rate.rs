//! Per-type sliding-window limit on events an activity may emit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct EventRateLimiter {
    limit: u32,
    window: Duration,
    seen: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl EventRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// `true` and record the event if the window has room, else `false`.
    pub fn check(&self, event_type: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.lock();
        let stamps = seen.entry(event_type.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            stamps.pop_front();
        }
        if stamps.len() >= self.limit as usize {
            return false;
        }
        stamps.push_back(now);
        true
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn saturates_then_recovers_after_window() {
        let limiter = EventRateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("PROGRESS"));
        assert!(limiter.check("PROGRESS"));
        assert!(limiter.check("PROGRESS"));
        assert!(!limiter.check("PROGRESS"));
        assert!(limiter.check("COMPLETE"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("PROGRESS"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_event() {
        let limiter = EventRateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.check("x"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.check("x"));
        assert!(!limiter.check("x"));
        tokio::time::advance(Duration::from_secs(5)).await;
        // first stamp has aged out, second has not
        assert!(limiter.check("x"));
        assert!(!limiter.check("x"));
    }

    #[test]
    fn reset_clears_counts() {
        let limiter = EventRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("x"));
        assert!(!limiter.check("x"));
        limiter.reset();
        assert!(limiter.check("x"));
    }
}
