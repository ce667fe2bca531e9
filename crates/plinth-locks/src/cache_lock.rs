//! Cache-backed lock provider.
//!
//! Uses the cache's atomic primitives: `add` (set-if-absent) to acquire,
//! `replace_if_equal` to renew and `remove_if_equal` to release, so a holder
//! can never release or extend a lock that was taken over after its lease
//! expired.

use crate::provider::LockProvider;
use async_trait::async_trait;
use plinth_cache::{CacheBackend, CacheKey};
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::Result;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const KEY_PREFIX: &str = "lock";

/// Distributed lock provider over any [`CacheBackend`]
pub struct CacheLockProvider {
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl CacheLockProvider {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            cache,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(resource: &str) -> CacheKey {
        CacheKey::with_namespace(KEY_PREFIX, resource)
    }
}

#[async_trait]
impl LockProvider for CacheLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        lock_timeout: Duration,
    ) -> Result<Option<String>> {
        let lock_id = Uuid::new_v4().to_string();
        let stored = self
            .cache
            .add(
                &Self::key(resource),
                lock_id.as_bytes().to_vec(),
                Some(lock_timeout),
            )
            .await?;
        Ok(stored.then_some(lock_id))
    }

    async fn release(&self, resource: &str, lock_id: &str) -> Result<bool> {
        self.cache
            .remove_if_equal(&Self::key(resource), lock_id.as_bytes())
            .await
    }

    async fn renew(&self, resource: &str, lock_id: &str, lock_timeout: Duration) -> Result<bool> {
        self.cache
            .replace_if_equal(
                &Self::key(resource),
                lock_id.as_bytes(),
                lock_id.as_bytes().to_vec(),
                Some(lock_timeout),
            )
            .await
    }

    async fn is_locked(&self, resource: &str) -> Result<bool> {
        self.cache.exists(&Self::key(resource)).await
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}
