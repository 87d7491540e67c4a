//! Bandwidth limiting with per-class token buckets.
//!
//! Every peer class carries one token bucket per channel (upload and
//! download). A connection belonging to several classes must satisfy
//! *every* bucket before moving bytes, so the most restrictive class wins.
//! Buckets are refilled from elapsed time on each acquire; callers sleep
//! for the returned wait instead of blocking inside the bucket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Traffic direction. Indexes the per-class channel array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Upload = 0,
    Download = 1,
}

/// A token bucket for one channel of one peer class.
///
/// Burst capacity is twice the rate. A rate of zero means unlimited.
pub struct Bucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    rate: u64,
    last_refill: Instant,
}

impl Bucket {
    pub fn new(rate: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BucketState {
                tokens: burst(rate),
                rate,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Changes the rate; accumulated tokens are clamped to the new burst.
    pub fn set_rate(&self, rate: u64) {
        let mut state = self.state.lock();
        state.rate = rate;
        state.tokens = state.tokens.min(burst(rate));
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate
    }

    /// Takes `bytes` tokens, returning how long the caller must wait
    /// before the debt is covered. `Duration::ZERO` means proceed now.
    pub fn acquire(&self, bytes: usize) -> Duration {
        let mut state = self.state.lock();
        if state.rate == 0 {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * state.rate as f64).min(burst(state.rate));

        let need = bytes as f64;
        if state.tokens >= need {
            state.tokens -= need;
            Duration::ZERO
        } else {
            let deficit = need - state.tokens;
            state.tokens = 0.0;
            Duration::from_secs_f64(deficit / state.rate as f64)
        }
    }

    /// Tokens currently available, for scheduling decisions.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        if state.rate == 0 {
            usize::MAX
        } else {
            state.tokens as usize
        }
    }
}

fn burst(rate: u64) -> f64 {
    if rate == 0 {
        f64::MAX
    } else {
        (rate * 2) as f64
    }
}

/// The bucket set a single connection drains for one channel: one bucket
/// per class the connection belongs to.
///
/// Shared with the connection's socket pump, which acquires before every
/// read or write.
#[derive(Clone, Default)]
pub struct ChannelLimiter {
    buckets: Vec<Arc<Bucket>>,
}

impl ChannelLimiter {
    pub fn new(buckets: Vec<Arc<Bucket>>) -> Self {
        Self { buckets }
    }

    pub fn unlimited() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }

    /// Acquires `bytes` from every bucket; the wait is the maximum of the
    /// individual waits, since all classes must be satisfied.
    pub fn acquire(&self, bytes: usize) -> Duration {
        self.buckets
            .iter()
            .map(|b| b.acquire(bytes))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Acquires and sleeps out the wait, for use inside socket pumps.
    pub async fn throttle(&self, bytes: usize) {
        let wait = self.acquire(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// The tightest per-second budget across the constituent buckets, or
    /// `None` when fully unlimited.
    pub fn min_rate(&self) -> Option<u64> {
        self.buckets
            .iter()
            .map(|b| b.rate())
            .filter(|&r| r > 0)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let bucket = Bucket::new(0);
        assert_eq!(bucket.acquire(usize::MAX / 2), Duration::ZERO);
    }

    #[test]
    fn burst_then_wait() {
        let bucket = Bucket::new(1000);
        // burst capacity is 2x rate
        assert_eq!(bucket.acquire(2000), Duration::ZERO);
        let wait = bucket.acquire(500);
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(600));
    }

    #[test]
    fn set_rate_clamps_tokens() {
        let bucket = Bucket::new(1_000_000);
        bucket.set_rate(100);
        assert!(bucket.available() <= 200);
    }

    #[test]
    fn most_restrictive_class_wins() {
        let fast = Bucket::new(1_000_000);
        let slow = Bucket::new(100);
        let limiter = ChannelLimiter::new(vec![fast, slow]);
        // drain slow's burst
        assert_eq!(limiter.acquire(200), Duration::ZERO);
        let wait = limiter.acquire(100);
        assert!(wait >= Duration::from_millis(900));
        assert_eq!(limiter.min_rate(), Some(100));
    }

    #[test]
    fn empty_limiter_is_unlimited() {
        let limiter = ChannelLimiter::unlimited();
        assert_eq!(limiter.acquire(1 << 30), Duration::ZERO);
        assert_eq!(limiter.min_rate(), None);
    }
}
