//! Throttling lock provider.
//!
//! Admits at most `max_hits` acquires per resource per period. Hits are
//! counted in a cache bucket keyed by the period start, so every process
//! sharing the cache backend shares the budget. Used by the cron runner to
//! guarantee a scheduled occurrence fires at most once across a cluster.

use crate::provider::LockProvider;
use async_trait::async_trait;
use plinth_cache::{CacheBackend, CacheKey};
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::Result;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const KEY_PREFIX: &str = "throttle";

/// Lock provider admitting `max_hits` acquires per period
pub struct ThrottlingLockProvider {
    cache: Arc<dyn CacheBackend>,
    max_hits: i64,
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl ThrottlingLockProvider {
    pub fn new(cache: Arc<dyn CacheBackend>, max_hits: u32, period: Duration) -> Self {
        Self {
            cache,
            max_hits: max_hits.max(1) as i64,
            period,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn bucket_key(&self, resource: &str) -> CacheKey {
        let period_ms = self.period.as_millis().max(1) as i64;
        let bucket = self.clock.utc_now().timestamp_millis() / period_ms;
        CacheKey::with_namespace(KEY_PREFIX, format!("{}:{}", resource, bucket))
    }
}

#[async_trait]
impl LockProvider for ThrottlingLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        _lock_timeout: Duration,
    ) -> Result<Option<String>> {
        // Bucket lives for two periods so a hit landing right before the
        // boundary still counts against the window it belongs to.
        let hits = self
            .cache
            .increment_with_expire(&self.bucket_key(resource), 1, self.period * 2)
            .await?;

        if hits <= self.max_hits {
            Ok(Some(Uuid::new_v4().to_string()))
        } else {
            tracing::debug!(resource, hits, max_hits = self.max_hits, "Throttle limit hit");
            Ok(None)
        }
    }

    async fn release(&self, _resource: &str, _lock_id: &str) -> Result<bool> {
        // Hits are spent, not returned.
        Ok(true)
    }

    async fn renew(
        &self,
        _resource: &str,
        _lock_id: &str,
        _lock_timeout: Duration,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn is_locked(&self, resource: &str) -> Result<bool> {
        let hits: i64 = self
            .cache
            .get(&self.bucket_key(resource))
            .await?
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(hits >= self.max_hits)
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_cache::InMemoryCacheBackend;
    use plinth_core::clock::ManualClock;

    fn throttled(max_hits: u32, period: Duration) -> (ThrottlingLockProvider, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(InMemoryCacheBackend::new().with_clock(clock.clone()));
        let provider = ThrottlingLockProvider::new(backend, max_hits, period).with_clock(clock.clone());
        (provider, clock)
    }

    #[tokio::test]
    async fn test_admits_up_to_max_hits() {
        let (provider, _clock) = throttled(2, Duration::from_secs(60));
        let timeout = Duration::from_secs(1);

        assert!(provider.try_acquire("job", timeout).await.unwrap().is_some());
        assert!(provider.try_acquire("job", timeout).await.unwrap().is_some());
        assert!(provider.try_acquire("job", timeout).await.unwrap().is_none());
        assert!(provider.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_budget_resets_next_period() {
        let (provider, clock) = throttled(1, Duration::from_secs(60));
        let timeout = Duration::from_secs(1);

        assert!(provider.try_acquire("job", timeout).await.unwrap().is_some());
        assert!(provider.try_acquire("job", timeout).await.unwrap().is_none());

        clock.advance(Duration::from_secs(61));
        assert!(
            provider.try_acquire("job", timeout).await.unwrap().is_some(),
            "next period has a fresh budget"
        );
    }

    #[tokio::test]
    async fn test_resources_are_independent() {
        let (provider, _clock) = throttled(1, Duration::from_secs(60));
        let timeout = Duration::from_secs(1);

        assert!(provider.try_acquire("job-a", timeout).await.unwrap().is_some());
        assert!(provider.try_acquire("job-b", timeout).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_backend_shares_budget() {
        let clock = ManualClock::starting_now();
        let backend: Arc<dyn CacheBackend> =
            Arc::new(InMemoryCacheBackend::new().with_clock(clock.clone()));

        let node_a = ThrottlingLockProvider::new(backend.clone(), 1, Duration::from_secs(60))
            .with_clock(clock.clone());
        let node_b = ThrottlingLockProvider::new(backend, 1, Duration::from_secs(60))
            .with_clock(clock.clone());
        let timeout = Duration::from_secs(1);

        let a = node_a.try_acquire("job", timeout).await.unwrap();
        let b = node_b.try_acquire("job", timeout).await.unwrap();
        assert_eq!(
            a.is_some() as u8 + b.is_some() as u8,
            1,
            "only one node wins the period"
        );
    }
}
