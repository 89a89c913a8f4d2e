//! Token bucket shared by every record that calls the downstream API.
//!
//! One instance models one external budget: all jobs draw from the same
//! bucket, first come first served. Time comes from `tokio::time` so the
//! bucket follows a paused test clock.

use crate::settings::Import;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: f64 = 4.0;
pub const DEFAULT_REFILL_PER_SEC: f64 = 2.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a bucket that starts full.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_settings(cfg: &Import) -> Self {
        Self::new(cfg.rate_limit_capacity, cfg.rate_limit_refill_per_sec)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token if available. Refills first, on every call.
    pub fn can_process(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole seconds until the next token is available, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        let needed = 1.0 - bucket.tokens;
        if needed <= 0.0 {
            return 0;
        }
        (needed / self.refill_per_sec).ceil() as u64
    }

    /// Wait until a token is granted. Only the calling task is suspended.
    pub async fn acquire(&self) {
        while !self.can_process() {
            let wait = Duration::from_secs(self.retry_after_secs());
            tracing::debug!(wait_secs = wait.as_secs(), "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Restore a full bucket.
    pub fn reset(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = self.capacity;
        bucket.last_refill = Instant::now();
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::default();

        let granted = (0..10).filter(|_| limiter.can_process()).count();

        assert_eq!(granted, 4);
        assert!(!limiter.can_process());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_when_exhausted() {
        let limiter = RateLimiter::default();
        while limiter.can_process() {}

        // (1 - 0) / 2 = 0.5s, rounded up
        let retry = limiter.retry_after_secs();
        assert!(retry > 0);
        assert!(retry <= 1);
        assert_eq!(retry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_zero_with_tokens() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.retry_after_secs(), 0);

        limiter.can_process();
        assert_eq!(limiter.retry_after_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::default();
        while limiter.can_process() {}

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.can_process());
        assert!(!limiter.can_process());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_process());
        assert!(limiter.can_process());
        assert!(!limiter.can_process());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let limiter = RateLimiter::default();
        limiter.can_process();

        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(limiter.available_tokens(), 4.0);
        let granted = (0..10).filter(|_| limiter.can_process()).count();
        assert_eq!(granted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_full_bucket() {
        let limiter = RateLimiter::default();
        while limiter.can_process() {}

        limiter.reset();

        let granted = (0..10).filter(|_| limiter.can_process()).count();
        assert_eq!(granted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::default();
        while limiter.can_process() {}

        let start = Instant::now();
        limiter.acquire().await;

        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_between_tasks() {
        let limiter = Arc::new(RateLimiter::default());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                (0..3).filter(|_| limiter.can_process()).count()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            granted += handle.await.unwrap();
        }

        assert_eq!(granted, 4);
    }
}
