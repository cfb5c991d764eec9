use std::{collections::HashMap, hash::Hash, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

/// Decides how long a failed item waits before it is delivered again.
#[async_trait]
pub trait RateLimiter<K>
where
    Self: Send + Sync,
{
    /// Returns the delay for the next retry of `key`, counting it as a failure.
    async fn when(&self, key: &K) -> Duration;

    /// Stops tracking `key`, resetting its failure counter.
    async fn forget(&self, key: &K);

    async fn num_requeues(&self, key: &K) -> usize;
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::default(),
        }
    }
}

#[async_trait]
impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(key.clone()).or_default();
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|backoff| backoff.min(self.max))
            .unwrap_or(self.max)
    }

    async fn forget(&self, key: &K) {
        self.failures.lock().await.remove(key);
    }

    async fn num_requeues(&self, key: &K) -> usize {
        self.failures
            .lock()
            .await
            .get(key)
            .map(|count| *count as usize)
            .unwrap_or_default()
    }
}

/// An overall token bucket shared by every key; it never tracks failures.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            state: Mutex::new(TokenBucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl<K> RateLimiter<K> for BucketRateLimiter
where
    K: Send + Sync,
{
    async fn when(&self, _key: &K) -> Duration {
        if self.qps.is_nan() || self.qps <= 0.0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;

        // reserve a token, even if it is only available in the future
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // a tiny qps may not fit into a `Duration`
            Duration::try_from_secs_f64(-state.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    async fn forget(&self, _key: &K) {}

    async fn num_requeues(&self, _key: &K) -> usize {
        0
    }
}

/// Applies the worst delay among all of its limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

#[async_trait]
impl<K> RateLimiter<K> for MaxOfRateLimiter<K>
where
    K: Send + Sync,
{
    async fn when(&self, key: &K) -> Duration {
        let mut delay = Duration::ZERO;
        for limiter in &self.limiters {
            delay = delay.max(limiter.when(key).await);
        }
        delay
    }

    async fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key).await;
        }
    }

    async fn num_requeues(&self, key: &K) -> usize {
        let mut requeues = 0;
        for limiter in &self.limiters {
            requeues = requeues.max(limiter.num_requeues(key).await);
        }
        requeues
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1_000),
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimiterConfig {
    /// Per-item exponential backoff combined with an overall token bucket.
    pub fn build<K>(&self) -> MaxOfRateLimiter<K>
    where
        K: 'static + Clone + Eq + Hash + Send + Sync,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}
