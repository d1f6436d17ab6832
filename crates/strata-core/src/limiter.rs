//! Token-bucket rate limiting.
//!
//! The front-end calls [`RateLimiter::try_acquire`] once per request and
//! turns a `false` into a slow-down response. The bucket refills at the
//! configured sustained rate and holds up to `burst_size` tokens, so short
//! bursts above the rate are absorbed.

use std::time::Instant;

use parking_lot::Mutex;

/// Mutable bucket state behind the mutex.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter sustaining `requests_per_second` with a burst
    /// capacity of `burst_size`. The bucket starts full.
    #[must_use]
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size.max(1));
        Self {
            rate_per_sec: f64::from(requests_per_second.max(1)),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns whether the request may proceed.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_many(1)
    }

    /// Take `n` tokens if available.
    #[must_use]
    pub fn try_acquire_many(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;

        let cost = f64::from(n);
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (approximate, for metrics).
    #[must_use]
    pub fn available(&self) -> f64 {
        let now = Instant::now();
        let state = self.state.lock();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rate_per_sec).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_allow_burst_up_to_capacity() {
        let limiter = RateLimiter::new(10, 5);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_should_refill_over_time() {
        let limiter = RateLimiter::new(1000, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(std::time::Duration::from_millis(10));
        // 1000/s refills ~10 tokens in 10ms, clamped to capacity 2.
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_should_not_exceed_capacity_after_idle() {
        let limiter = RateLimiter::new(1000, 3);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(limiter.available() <= 3.0);
    }

    #[test]
    fn test_should_acquire_many_atomically() {
        let limiter = RateLimiter::new(10, 4);
        assert!(limiter.try_acquire_many(4));
        assert!(!limiter.try_acquire_many(2));
    }
}
