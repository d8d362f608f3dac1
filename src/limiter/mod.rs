use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProvidersConfig;
use crate::error::{CoreError, Result};

// Type alias for the direct limiter to simplify signatures
type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct ProviderBucket {
    limiter: Arc<DirectLimiter>,
    /// Time for one token to refill; the bounded wait is a small multiple.
    refill: Duration,
    max_wait: Duration,
}

/// Per-provider token-bucket gate. Each provider key owns an independent
/// bucket, so exhausting one budget never blocks calls to another.
pub struct ProviderRateLimiter {
    buckets: HashMap<String, ProviderBucket>,
    clock: DefaultClock,
}

impl ProviderRateLimiter {
    /// Build buckets from `(provider, max_requests, interval_ms)` triples.
    pub fn new(providers: &[(&str, u32, u64)]) -> Self {
        let mut buckets = HashMap::new();

        for &(name, max_requests, interval_ms) in providers {
            let max_requests = max_requests.max(1);
            let refill = Duration::from_millis((interval_ms / max_requests as u64).max(1));
            let quota = Quota::with_period(refill)
                .unwrap()
                .allow_burst(NonZeroU32::new(max_requests).unwrap());

            buckets.insert(
                name.to_string(),
                ProviderBucket {
                    limiter: Arc::new(RateLimiter::direct(quota)),
                    refill,
                    max_wait: (refill * 4).max(Duration::from_millis(100)),
                },
            );
        }

        Self {
            buckets,
            clock: DefaultClock::default(),
        }
    }

    pub fn from_config(cfg: &ProvidersConfig) -> Self {
        Self::new(&[
            (
                "coingecko",
                cfg.coingecko.max_requests,
                cfg.coingecko.interval_ms,
            ),
            ("binance", cfg.binance.max_requests, cfg.binance.interval_ms),
        ])
    }

    /// Wait for a slot, bounded by a few refill intervals. Past the bound
    /// the caller gets `RateLimited` with the retry-after duration instead
    /// of hanging.
    pub async fn acquire(&self, provider: &str) -> Result<()> {
        let Some(bucket) = self.buckets.get(provider) else {
            tracing::debug!(provider, "no rate limit configured, passing through");
            return Ok(());
        };

        match tokio::time::timeout(bucket.max_wait, bucket.limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(CoreError::RateLimited {
                provider: provider.to_string(),
                retry_after: self.retry_after(bucket),
            }),
        }
    }

    /// Non-blocking variant: either a grant now or the retry-after duration.
    pub fn try_acquire(&self, provider: &str) -> Result<()> {
        let Some(bucket) = self.buckets.get(provider) else {
            return Ok(());
        };

        match bucket.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => Err(CoreError::RateLimited {
                provider: provider.to_string(),
                retry_after: not_until.wait_time_from(self.clock.now()),
            }),
        }
    }

    fn retry_after(&self, bucket: &ProviderBucket) -> Duration {
        match bucket.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()).max(bucket.refill),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_provider_passes_through() {
        let rl = ProviderRateLimiter::new(&[("binance", 10, 1000)]);
        assert!(rl.acquire("unknown").await.is_ok());
        assert!(rl.try_acquire("unknown").is_ok());
    }

    #[tokio::test]
    async fn test_burst_then_rate_limited() {
        let rl = ProviderRateLimiter::new(&[("coingecko", 3, 60_000)]);

        for _ in 0..3 {
            assert!(rl.try_acquire("coingecko").is_ok());
        }

        let err = rl.try_acquire("coingecko").unwrap_err();
        match err {
            CoreError::RateLimited {
                provider,
                retry_after,
            } => {
                assert_eq!(provider, "coingecko");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let rl = ProviderRateLimiter::new(&[("coingecko", 1, 60_000), ("binance", 1, 60_000)]);

        assert!(rl.try_acquire("coingecko").is_ok());
        assert!(rl.try_acquire("coingecko").is_err());
        // Exhausting coingecko must not block binance
        assert!(rl.try_acquire("binance").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_is_bounded() {
        // One request per hour: the second acquire can never be granted
        // within the bounded wait and must surface RateLimited.
        let rl = ProviderRateLimiter::new(&[("slow", 1, 3_600_000)]);

        assert!(rl.acquire("slow").await.is_ok());
        let err = rl.acquire("slow").await.unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_acquire_blocks_then_grants() {
        // 2 per 200ms: refill is 100ms, bounded wait 400ms, so a third
        // acquire waits for a slot instead of failing.
        let rl = ProviderRateLimiter::new(&[("fast", 2, 200)]);

        assert!(rl.acquire("fast").await.is_ok());
        assert!(rl.acquire("fast").await.is_ok());
        assert!(rl.acquire("fast").await.is_ok());
    }
}
