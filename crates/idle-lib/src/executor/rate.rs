//! Sliding-window cap on terminal actions

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60 * 60);

/// Allows at most `max` recorded actions per rolling hour; `0` disables it
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    taken: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_hour(max: u32) -> Self {
        Self::with_window(max, WINDOW)
    }

    pub fn with_window(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            taken: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve one slot, or `false` when the window is full
    pub fn try_acquire(&self) -> bool {
        if self.max == 0 {
            return true;
        }

        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while let Some(front) = taken.front() {
            if now.duration_since(*front) >= self.window {
                taken.pop_front();
            } else {
                break;
            }
        }

        if taken.len() as u32 >= self.max {
            return false;
        }
        taken.push_back(now);
        true
    }

    /// Return the most recent slot (the claim it was reserved for was not won)
    pub fn release(&self) {
        if self.max == 0 {
            return;
        }
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        taken.pop_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_within_window() {
        let limiter = RateLimiter::per_hour(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.release();
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::with_window(1, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_zero_disables_limit() {
        let limiter = RateLimiter::per_hour(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
    }
}
