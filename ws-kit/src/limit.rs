//! Token-bucket rate limiter.
//!
//! Buckets are created lazily per key on first [`consume`](RateLimiter::consume)
//! and refilled lazily from elapsed wall time. Each key is guarded by its
//! own FIFO mutex (`tokio::sync::Mutex` queues waiters in arrival order),
//! so concurrent consumers of one key serialize fairly and never observe a
//! torn refill: ten concurrent `consume(1)` calls against a fresh bucket of
//! capacity five admit exactly five.
//!
//! The limiter never errors and never panics; the decision is a plain
//! tagged value the caller inspects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex;

/// Time source for refill arithmetic. Production uses [`SystemClock`];
/// tests inject a manual clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Bucket policy. Frozen at limiter creation: later mutations of the
/// caller's copy have no effect on an existing limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum (and initial) token count. Clamped to at least 1.
    pub capacity: u32,
    /// Refill rate. Clamped to a positive value.
    pub tokens_per_second: f64,
    /// Optional namespace prepended to every key.
    pub prefix: Option<String>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            tokens_per_second: 1.0,
            prefix: None,
        }
    }
}

/// The outcome of a [`consume`](RateLimiter::consume) call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole tokens left in the bucket after this decision.
    pub remaining: u64,
    /// How long until `cost` tokens will have accrued. `None` on allowed
    /// decisions, and on rejections whose cost exceeds capacity (waiting
    /// cannot help).
    pub retry_after_ms: Option<u64>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token buckets behind a shared policy.
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    prefix: String,
    clock: Arc<dyn Clock>,
    buckets: StdMutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: f64::from(config.capacity.max(1)),
            rate: config.tokens_per_second.max(f64::MIN_POSITIVE),
            prefix: config.prefix.unwrap_or_default(),
            clock,
            buckets: StdMutex::new(HashMap::new()),
        }
    }

    /// The frozen policy.
    pub fn policy(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.capacity as u32,
            tokens_per_second: self.rate,
            prefix: if self.prefix.is_empty() {
                None
            } else {
                Some(self.prefix.clone())
            },
        }
    }

    /// Try to take `cost` tokens from `key`'s bucket.
    ///
    /// Refill before the decision: elapsed time is clamped at zero (a clock
    /// regression never debits) and the refill is floored to whole tokens.
    pub async fn consume(&self, key: &str, cost: u32) -> RateDecision {
        let bucket = self.bucket_for(key);
        let mut bucket = bucket.lock().await;

        let now = self.clock.now();
        // Instant::saturating_duration_since clamps regressions to zero
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let refill = (elapsed * self.rate).floor();
        bucket.tokens = (bucket.tokens + refill).min(self.capacity);
        bucket.last_refill = now;

        let cost = f64::from(cost);
        if bucket.tokens < cost {
            let retry_after_ms = if cost > self.capacity {
                None
            } else {
                Some(((cost - bucket.tokens) / self.rate * 1000.0).ceil() as u64)
            };
            RateDecision {
                allowed: false,
                remaining: bucket.tokens.floor() as u64,
                retry_after_ms,
            }
        } else {
            bucket.tokens -= cost;
            RateDecision {
                allowed: true,
                remaining: bucket.tokens.floor() as u64,
                retry_after_ms: None,
            }
        }
    }

    /// Drop every bucket and its mutex.
    pub fn dispose(&self) {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn bucket_for(&self, key: &str) -> Arc<Mutex<Bucket>> {
        let full_key = format!("{}{}", self.prefix, key);
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets
            .entry(full_key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: self.capacity,
                    last_refill: self.clock.now(),
                }))
            })
            .clone()
    }
}

/// A hand-cranked clock for deterministic refill tests.
#[cfg(any(test, feature = "test-utils"))]
pub struct ManualClock {
    now: StdMutex<Instant>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: StdMutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: core::time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    /// Simulate clock skew: move time backwards.
    pub fn rewind(&self, by: core::time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(earlier) = now.checked_sub(by) {
            *now = earlier;
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;

    fn limiter(capacity: u32, rate: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let lim = RateLimiter::with_clock(
            RateLimiterConfig {
                capacity,
                tokens_per_second: rate,
                prefix: None,
            },
            clock.clone(),
        );
        (lim, clock)
    }

    #[tokio::test]
    async fn drains_then_rejects() {
        let (lim, _clock) = limiter(3, 1.0);
        for remaining in [2, 1, 0] {
            let d = lim.consume("k", 1).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, remaining);
        }
        let d = lim.consume("k", 1).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_ms, Some(1000));
    }

    #[tokio::test]
    async fn refills_with_elapsed_time_floored() {
        let (lim, clock) = limiter(5, 2.0);
        assert!(lim.consume("k", 5).await.allowed);
        // 0.4s at 2/s accrues 0.8 tokens, floored to 0
        clock.advance(Duration::from_millis(400));
        assert!(!lim.consume("k", 1).await.allowed);
        clock.advance(Duration::from_secs(2));
        let d = lim.consume("k", 1).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 3);
    }

    #[tokio::test]
    async fn clock_regression_never_refills_and_never_debits() {
        let (lim, clock) = limiter(5, 10.0);
        assert!(lim.consume("k", 3).await.allowed);
        clock.rewind(Duration::from_secs(30));
        // elapsed clamps to zero: no refill, and the balance is untouched
        let d = lim.consume("k", 1).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        let d = lim.consume("k", 2).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn cost_above_capacity_is_hopeless() {
        let (lim, _clock) = limiter(5, 1.0);
        let d = lim.consume("k", 6).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_ms, None);
    }

    #[tokio::test]
    async fn concurrent_consumers_split_exactly() {
        let (lim, _clock) = limiter(5, 0.001);
        let lim = Arc::new(lim);
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let lim = lim.clone();
            tasks.push(tokio::spawn(async move { lim.consume("shared", 1).await }));
        }
        let mut allowed = 0;
        for t in tasks {
            let d = t.await.unwrap();
            if d.allowed {
                allowed += 1;
            } else {
                let retry = d.retry_after_ms.unwrap();
                assert!(retry > 0);
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn keys_are_independent_and_prefixed() {
        let clock = Arc::new(ManualClock::new());
        let lim = RateLimiter::with_clock(
            RateLimiterConfig {
                capacity: 1,
                tokens_per_second: 1.0,
                prefix: Some("conn:".to_owned()),
            },
            clock,
        );
        assert!(lim.consume("a", 1).await.allowed);
        assert!(lim.consume("b", 1).await.allowed);
        assert!(!lim.consume("a", 1).await.allowed);
        assert_eq!(lim.policy().prefix.as_deref(), Some("conn:"));
    }

    #[tokio::test]
    async fn dispose_resets_buckets() {
        let (lim, _clock) = limiter(1, 0.001);
        assert!(lim.consume("k", 1).await.allowed);
        assert!(!lim.consume("k", 1).await.allowed);
        lim.dispose();
        assert!(lim.consume("k", 1).await.allowed);
    }
}
