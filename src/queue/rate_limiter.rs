//! Requeue rate limiting.
//!
//! Decides how long a failed item waits before it is handed to a worker
//! again. Limiters are owned by a queue and shared by its workers, so state
//! lives behind a lock and every method takes `&self`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{BucketConfig, RetryConfig, WorkItem};

/// Requeue delay policy.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Delay before `item` may be processed again. Records a failure.
    fn when(&self, item: &WorkItem) -> Duration;

    /// Clear the failure history of `item`.
    fn forget(&self, item: &WorkItem);

    /// Failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &WorkItem) -> u32;
}

/// Per-item exponential backoff: `base_delay * 2^failures`, capped at
/// `max_delay`.
#[derive(Debug)]
pub struct ItemExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<WorkItem, u32>>,
}

impl ItemExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&self, item: &WorkItem) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        // Float math so large exponents saturate instead of overflowing.
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exp.min(1024) as i32);
        if !backoff.is_finite() || backoff >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &WorkItem) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &WorkItem) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Token bucket state.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Upper bound for a single bucket delay.
const MAX_BUCKET_DELAY: Duration = Duration::from_secs(300);

/// Overall token bucket shared by every item.
///
/// `when` reserves a token; if the bucket is empty the returned delay is the
/// time until that reservation is covered, capped at five minutes. A
/// non-positive or non-finite `qps` disables the bucket.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let qps = if qps.is_finite() && qps > 0.0 {
            Some(qps)
        } else {
            tracing::warn!(qps, "Invalid bucket rate, requeues will not be rate limited");
            None
        };
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &BucketConfig) -> Self {
        Self::new(config.qps, config.burst)
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _item: &WorkItem) -> Duration {
        let Some(qps) = self.qps else {
            return Duration::ZERO;
        };

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * qps).min(self.burst);
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-bucket.tokens / qps)
            .map_or(MAX_BUCKET_DELAY, |delay| delay.min(MAX_BUCKET_DELAY))
    }

    fn forget(&self, _item: &WorkItem) {}

    fn num_requeues(&self, _item: &WorkItem) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay wins.
#[derive(Debug)]
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, item: &WorkItem) -> Duration {
        // Every member must observe the failure, so no short-circuiting.
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &WorkItem) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &WorkItem) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The limiter a queue uses for a given retry policy and optional bucket.
pub fn default_rate_limiter(
    retry: &RetryConfig,
    bucket: Option<&BucketConfig>,
) -> Box<dyn RateLimiter> {
    let backoff = Box::new(ItemExponentialBackoff::from_config(retry));
    match bucket {
        Some(bucket) => Box::new(MaxOfRateLimiter::new(vec![
            backoff,
            Box::new(BucketRateLimiter::from_config(bucket)),
        ])),
        None => backoff,
    }
}
