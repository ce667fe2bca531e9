//! Lock provider contract and the scoped lock guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plinth_core::clock::Clock;
use plinth_core::error::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default lease length when the caller does not specify one
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default time to keep retrying an acquire before giving up
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend contract for distributed locks.
///
/// `try_acquire` is atomic per `(provider, resource)` and returns an owner
/// token on success; `release`/`renew` only act when the caller still owns the
/// lock (token match).
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Attempt one atomic acquire; returns the owner token on success
    async fn try_acquire(&self, resource: &str, lock_timeout: Duration)
        -> Result<Option<String>>;

    /// Release the lock if `lock_id` still owns it
    async fn release(&self, resource: &str, lock_id: &str) -> Result<bool>;

    /// Extend the lease if `lock_id` still owns it
    async fn renew(&self, resource: &str, lock_id: &str, lock_timeout: Duration) -> Result<bool>;

    /// Whether the resource is currently held by anyone
    async fn is_locked(&self, resource: &str) -> Result<bool>;

    /// Time source used for acquire waits
    fn clock(&self) -> Arc<dyn Clock>;
}

/// Acquired lock handle; releases on all exit paths.
///
/// Dropping an unreleased lock spawns a best-effort release so a panicking
/// holder does not pin the resource for the full lease.
pub struct Lock {
    resource: String,
    lock_id: String,
    acquired_at: DateTime<Utc>,
    time_waited: Duration,
    provider: Arc<dyn LockProvider>,
    released: AtomicBool,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("resource", &self.resource)
            .field("lock_id", &self.lock_id)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Lock {
    pub(crate) fn new(
        resource: String,
        lock_id: String,
        time_waited: Duration,
        provider: Arc<dyn LockProvider>,
    ) -> Self {
        let acquired_at = provider.clock().utc_now();
        Self {
            resource,
            lock_id,
            acquired_at,
            time_waited,
            provider,
            released: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// How long the acquire waited before succeeding
    pub fn time_waited(&self) -> Duration {
        self.time_waited
    }

    /// Release the lock; idempotent
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let released = self
            .provider
            .release(&self.resource, &self.lock_id)
            .await?;
        if !released {
            tracing::debug!(
                resource = %self.resource,
                "Lock was no longer owned at release (lease expired or taken over)"
            );
        }
        Ok(())
    }

    /// Extend the lease
    pub async fn renew(&self, lock_timeout: Option<Duration>) -> Result<bool> {
        let timeout = lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        self.provider
            .renew(&self.resource, &self.lock_id, timeout)
            .await
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::warn!(resource = %self.resource, "Lock dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let provider = self.provider.clone();
            let resource = std::mem::take(&mut self.resource);
            let lock_id = std::mem::take(&mut self.lock_id);
            handle.spawn(async move {
                if let Err(error) = provider.release(&resource, &lock_id).await {
                    tracing::error!(%resource, %error, "Best-effort lock release failed");
                }
            });
        }
    }
}

/// Acquire-with-wait loop shared by all providers.
#[async_trait]
pub trait LockProviderExt {
    /// Acquire the lock, retrying with jittered backoff up to `acquire_timeout`.
    /// Returns `None` when the lock could not be obtained in time.
    async fn acquire(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
    ) -> Result<Option<Lock>>;

    /// Same as [`acquire`](Self::acquire) but also aborts when `cancellation`
    /// fires, returning `None`.
    async fn acquire_cancellable(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
        cancellation: &CancellationToken,
    ) -> Result<Option<Lock>>;
}

#[async_trait]
impl LockProviderExt for Arc<dyn LockProvider> {
    async fn acquire(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
    ) -> Result<Option<Lock>> {
        let token = CancellationToken::new();
        self.acquire_cancellable(resource, lock_timeout, acquire_timeout, &token)
            .await
    }

    async fn acquire_cancellable(
        &self,
        resource: &str,
        lock_timeout: Option<Duration>,
        acquire_timeout: Option<Duration>,
        cancellation: &CancellationToken,
    ) -> Result<Option<Lock>> {
        let lock_timeout = lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let acquire_timeout = acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT);
        let clock = self.clock();
        let started = clock.utc_now();
        let deadline = started
            + chrono::Duration::from_std(acquire_timeout).unwrap_or(chrono::Duration::MAX);

        let mut delay = Duration::from_millis(50);
        loop {
            if cancellation.is_cancelled() {
                return Ok(None);
            }

            if let Some(lock_id) = self.try_acquire(resource, lock_timeout).await? {
                let waited = (clock.utc_now() - started).to_std().unwrap_or_default();
                tracing::debug!(resource, waited_ms = waited.as_millis() as u64, "Lock acquired");
                return Ok(Some(Lock::new(
                    resource.to_string(),
                    lock_id,
                    waited,
                    self.clone(),
                )));
            }

            let now = clock.utc_now();
            if now >= deadline {
                tracing::debug!(resource, "Lock not acquired within acquire timeout");
                return Ok(None);
            }

            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            let sleep_for = (delay + Duration::from_millis(jitter)).min(remaining);

            tokio::select! {
                _ = cancellation.cancelled() => return Ok(None),
                _ = clock.sleep(sleep_for) => {}
            }

            delay = (delay * 2).min(Duration::from_secs(1));
        }
    }
}
