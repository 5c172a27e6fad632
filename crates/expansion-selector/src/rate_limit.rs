//! Rate limiting and retry for provider calls
//!
//! A token bucket per caller key paces requests; transient provider errors
//! are retried with bounded exponential backoff. When retries run out the
//! failure surfaces as `ProviderUnavailable` so each validator applies its
//! own failure policy.

use crate::config::RetryPolicy;
use crate::provider::ProviderError;
use crate::SelectorError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Upper bound on a single backoff sleep
const MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token bucket keyed by caller
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// `n` requests per minute with a burst of `n`
    pub fn per_minute(n: u32) -> Self {
        Self::new(n, f64::from(n.max(1)) / 60.0)
    }

    /// Take a token if one is available, otherwise report how long until one is
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            updated: now,
        });

        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec))
        }
    }

    /// Wait until a token for `key` is available
    pub async fn acquire(&self, key: &str) {
        while let Err(wait) = self.try_acquire(key) {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Backoff before retry number `attempt` (1-based)
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let computed = policy.backoff_base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10));
    Duration::from_millis(computed.min(MAX_DELAY_MS))
}

/// Run `operation` with up to `policy.max_retries` extra attempts on
/// transient provider errors. Non-retriable errors return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    provider: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, SelectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retriable() || attempt >= policy.max_retries {
                    return Err(exhausted(provider, err, attempt + 1));
                }
                attempt += 1;
                let mut delay = backoff_delay(policy, attempt);
                if let ProviderError::RateLimited {
                    retry_after_ms: Some(ms),
                } = err
                {
                    delay = delay.max(Duration::from_millis(ms.min(MAX_DELAY_MS)));
                }
                warn!(
                    provider,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed; retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn exhausted(provider: &str, err: ProviderError, attempts: u32) -> SelectorError {
    let reason = match err {
        ProviderError::RateLimited { .. } => SelectorError::RateLimitExceeded {
            provider: provider.to_string(),
            attempts,
        }
        .to_string(),
        other => other.to_string(),
    };
    SelectorError::ProviderUnavailable {
        provider: provider.to_string(),
        reason,
    }
}

/// Pacing plus retry in front of one provider
#[derive(Debug)]
pub struct ProviderGate {
    provider: String,
    limiter: Option<TokenBucket>,
    retry: RetryPolicy,
}

impl ProviderGate {
    pub fn new(provider: impl Into<String>, requests_per_minute: Option<u32>, retry: RetryPolicy) -> Self {
        Self {
            provider: provider.into(),
            limiter: requests_per_minute.map(TokenBucket::per_minute),
            retry,
        }
    }

    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, SelectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let limiter = self.limiter.as_ref();
        let key = self.provider.as_str();
        retry_with_backoff(key, &self.retry, || {
            let fut = operation();
            async move {
                if let Some(limiter) = limiter {
                    limiter.acquire(key).await;
                }
                fut.await
            }
        })
        .await
    }
}
