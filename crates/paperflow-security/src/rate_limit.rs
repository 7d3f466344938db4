use paperflow_core::config::RateLimitConfig;
use paperflow_core::{PaperflowError, PaperflowResult, ProviderId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Absorbs float drift so a caller that slept exactly the computed deficit
/// is not sent back to sleep for a few nanoseconds.
const EPSILON: f64 = 1e-9;

/// Capacity and refill rate of one provider's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens the bucket holds (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    /// A bucket holding `capacity` tokens, refilled at `refill_per_sec`.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

impl From<&RateLimitConfig> for BucketConfig {
    /// Refill at the stricter of the two ceilings; capacity is `burst` when
    /// set, otherwise one second's allowance (or one minute's when only a
    /// per-minute ceiling exists), never below a single request.
    fn from(limit: &RateLimitConfig) -> Self {
        let per_minute_rate = limit.requests_per_minute.map(|rpm| rpm / 60.0);
        let refill_per_sec = match (limit.requests_per_second, per_minute_rate) {
            (Some(rps), Some(rpm)) => rps.min(rpm),
            (Some(rps), None) => rps,
            (None, Some(rpm)) => rpm,
            (None, None) => f64::INFINITY,
        };
        let capacity = limit
            .burst
            .or(limit.requests_per_second)
            .or(limit.requests_per_minute)
            .unwrap_or(1.0)
            .max(1.0);
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

/// How `acquire` behaves when the bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Sleep until a token is available, giving up after the timeout.
    Wait(Duration),
    /// Fail immediately with `RateLimitExceeded`.
    NoWait,
}

/// A consumed rate-limit token.
#[derive(Debug, Clone)]
pub struct RatePermit {
    /// Bucket the token came from.
    pub provider: ProviderId,
    /// Tokens consumed.
    pub cost: u32,
    /// Time spent waiting for the bucket to refill.
    pub waited: Duration,
}

struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.capacity);
        self.last_refill = now;
    }
}

/// Token-bucket rate limiter keyed by provider.
///
/// Buckets are created up front; each sits behind its own mutex so callers
/// for different providers never contend. Refill is computed lazily on every
/// acquire from the time elapsed since the previous one.
#[derive(Default)]
pub struct RateLimiter {
    buckets: HashMap<ProviderId, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    /// Create a limiter with no throttled providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the bucket for a provider.
    pub fn with_provider(mut self, provider: impl Into<ProviderId>, config: BucketConfig) -> Self {
        self.set_provider(provider, config);
        self
    }

    /// Add (or replace) the bucket for a provider.
    pub fn set_provider(&mut self, provider: impl Into<ProviderId>, config: BucketConfig) {
        self.buckets
            .insert(provider.into(), Arc::new(Mutex::new(Bucket::new(config))));
    }

    /// Build from configured ceilings.
    pub fn from_limits<'a>(
        limits: impl IntoIterator<Item = (ProviderId, &'a RateLimitConfig)>,
    ) -> Self {
        let mut limiter = Self::new();
        for (provider, limit) in limits {
            limiter.set_provider(provider, BucketConfig::from(limit));
        }
        limiter
    }

    /// Providers that have a bucket.
    pub fn providers(&self) -> Vec<&ProviderId> {
        let mut ids: Vec<&ProviderId> = self.buckets.keys().collect();
        ids.sort();
        ids
    }

    /// Tokens currently available (after refill), or `None` if unthrottled.
    pub fn available(&self, provider: &ProviderId) -> Option<f64> {
        let bucket = self.buckets.get(provider)?;
        let mut bucket = bucket.lock();
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    /// Take `cost` tokens from the provider's bucket.
    ///
    /// Providers without a bucket are unthrottled and always get a permit.
    pub async fn acquire(
        &self,
        provider: &ProviderId,
        cost: u32,
        mode: AcquireMode,
    ) -> PaperflowResult<RatePermit> {
        let Some(bucket) = self.buckets.get(provider) else {
            return Ok(RatePermit {
                provider: provider.clone(),
                cost,
                waited: Duration::ZERO,
            });
        };

        let started = Instant::now();
        let deadline = match mode {
            AcquireMode::Wait(timeout) => Some(started + timeout),
            AcquireMode::NoWait => None,
        };
        let needed = f64::from(cost);

        loop {
            let deficit_wait = {
                let mut bucket = bucket.lock();
                if needed > bucket.config.capacity {
                    return Err(PaperflowError::RateLimitExceeded {
                        provider: provider.clone(),
                        reason: format!(
                            "cost {cost} exceeds bucket capacity {}",
                            bucket.config.capacity
                        ),
                    });
                }

                let now = Instant::now();
                bucket.refill(now);
                if bucket.tokens + EPSILON >= needed {
                    bucket.tokens = (bucket.tokens - needed).max(0.0);
                    let waited = now.saturating_duration_since(started);
                    debug!(
                        provider = %provider,
                        cost,
                        remaining = bucket.tokens,
                        waited_ms = waited.as_millis() as u64,
                        "Rate permit granted"
                    );
                    return Ok(RatePermit {
                        provider: provider.clone(),
                        cost,
                        waited,
                    });
                }

                if bucket.config.refill_per_sec <= 0.0 {
                    return Err(PaperflowError::RateLimitExceeded {
                        provider: provider.clone(),
                        reason: "bucket exhausted and never refills".to_string(),
                    });
                }
                Duration::from_secs_f64((needed - bucket.tokens) / bucket.config.refill_per_sec)
            };

            let Some(deadline) = deadline else {
                return Err(PaperflowError::RateLimitExceeded {
                    provider: provider.clone(),
                    reason: "no token available".to_string(),
                });
            };
            if Instant::now() + deficit_wait > deadline {
                return Err(PaperflowError::RateLimitExceeded {
                    provider: provider.clone(),
                    reason: format!(
                        "no token within {}ms",
                        deadline.saturating_duration_since(started).as_millis()
                    ),
                });
            }
            tokio::time::sleep(deficit_wait).await;
        }
    }

    /// Non-blocking acquire of a single token.
    pub async fn try_acquire(&self, provider: &ProviderId) -> PaperflowResult<RatePermit> {
        self.acquire(provider, 1, AcquireMode::NoWait).await
    }
}
