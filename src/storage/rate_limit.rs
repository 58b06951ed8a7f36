//! Token-bucket rate limiter.
//!
//! Used to throttle change notifications so a burst of writes collapses to a
//! single notification per period instead of hammering the backend.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    amount: u32,
    window: Duration,
    acquisitions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(amount: u32, window: Duration) -> Self {
        Self {
            amount,
            window,
            acquisitions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_second(amount: u32) -> Self {
        Self::new(amount, Duration::from_secs(1))
    }

    /// Take a token if one is available. Non-blocking.
    pub fn try_acquire(&self) -> bool {
        let mut acquisitions = self.acquisitions.lock().unwrap();
        let now = Instant::now();
        while let Some(front) = acquisitions.front() {
            if now.duration_since(*front) >= self.window {
                acquisitions.pop_front();
            } else {
                break;
            }
        }
        if acquisitions.len() < self.amount as usize {
            acquisitions.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_amount_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn window_expiry_frees_tokens() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }
}
