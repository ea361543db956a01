use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket shared by all workers, capping the aggregate request rate.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// A limiter allowing `per_second` acquisitions per second after an initial burst of
    /// `burst` (at least one).
    ///
    /// # Panics
    ///
    /// Panics if `per_second` is not positive.
    #[must_use]
    pub fn new(per_second: f64, burst: u32) -> Self {
        assert!(per_second > 0.0, "rate limit must be positive");
        let capacity = f64::from(burst.max(1));
        Self {
            per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits for a token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let refill = now.duration_since(bucket.refilled_at).as_secs_f64() * self.per_second;
                bucket.tokens = (bucket.tokens + refill).min(self.capacity);
                bucket.refilled_at = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
