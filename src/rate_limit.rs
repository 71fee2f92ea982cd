//! Per-client rate limiting.
//!
//! Generalizes the teacher's `GuestUsageMap` (a plain
//! `Arc<Mutex<HashMap<String, GuestUsage>>>` keyed by a daily-reset
//! counter) into a real sliding window keyed by client IP. Same
//! non-async, std-`Mutex` critical section as the teacher — the work
//! inside the lock is a handful of `VecDeque` operations, never worth
//! crossing an await point for.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self { window, max_requests, state: Mutex::new(HashMap::new()) }
    }

    /// `true` if `key` is under its limit for the current window, and
    /// records the attempt; `false` if the caller should be rejected.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock().expect("rate limiter mutex poisoned");
        let entry = guard.entry(key.to_string()).or_default();

        while let Some(&oldest) = entry.front() {
            if now.duration_since(oldest) > self.window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drops any client key whose window has fully elapsed, so long-idle
    /// callers don't accumulate in the map forever.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut guard = self.state.lock().expect("rate limiter mutex poisoned");
        guard.retain(|_, entries| {
            while let Some(&oldest) = entries.front() {
                if now.duration_since(oldest) > self.window {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
    }

    #[test]
    fn rejects_once_the_limit_is_reached() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn window_expiry_frees_up_capacity() {
        let limiter = RateLimiter::new(Duration::from_millis(20), 1);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("a"));
    }

    #[test]
    fn sweep_drops_fully_expired_keys() {
        let limiter = RateLimiter::new(Duration::from_millis(20), 1);
        limiter.check("a");
        std::thread::sleep(Duration::from_millis(30));
        limiter.sweep();
        assert!(limiter.state.lock().unwrap().is_empty());
    }
}
