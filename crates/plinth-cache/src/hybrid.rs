//! Two-level cache: a process-local backend in front of a shared one,
//! kept coherent through invalidation messages on the bus.
//!
//! Reads hit the local level first; writes go to both levels and broadcast
//! an invalidation so other nodes drop their stale local copy. The
//! originating node tags its messages and skips its own broadcasts.

use crate::backend::CacheBackend;
use crate::key::CacheKey;
use async_trait::async_trait;
use plinth_core::error::Result;
use plinth_messaging::{Message, MessageBus, MessageBusExt, Subscription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Broadcast when a node writes or removes a shared cache entry
#[derive(Debug, Clone)]
pub struct CacheInvalidation {
    pub sender_id: String,
    /// Exact key, or a prefix when `is_prefix` is set; empty + prefix = flush
    pub key: String,
    pub is_prefix: bool,
}

impl Message for CacheInvalidation {
    fn message_type() -> &'static str {
        "cache-invalidation"
    }
}

/// Cache backend layering a local level over a shared one
pub struct HybridCacheBackend {
    node_id: String,
    local: Arc<dyn CacheBackend>,
    shared: Arc<dyn CacheBackend>,
    bus: Arc<dyn MessageBus>,
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    _invalidation_sub: Subscription,
}

impl HybridCacheBackend {
    pub fn new(
        local: Arc<dyn CacheBackend>,
        shared: Arc<dyn CacheBackend>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<Self>> {
        let node_id = Uuid::new_v4().to_string();

        let local_for_sub = local.clone();
        let own_id = node_id.clone();
        let subscription =
            bus.subscribe::<CacheInvalidation, _, _>(move |invalidation| {
                let local = local_for_sub.clone();
                let own_id = own_id.clone();
                async move {
                    if invalidation.sender_id == own_id {
                        return Ok(());
                    }
                    if invalidation.is_prefix {
                        local.remove_by_prefix(&invalidation.key).await?;
                    } else {
                        local.remove(&CacheKey::new(invalidation.key.clone())).await?;
                    }
                    Ok(())
                }
            })?;

        Ok(Arc::new(Self {
            node_id,
            local,
            shared,
            bus,
            local_hits: AtomicU64::new(0),
            local_misses: AtomicU64::new(0),
            _invalidation_sub: subscription,
        }))
    }

    /// Reads served from the local level
    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    /// Reads that had to fall through to the shared level
    pub fn local_misses(&self) -> u64 {
        self.local_misses.load(Ordering::Relaxed)
    }

    async fn broadcast(&self, key: String, is_prefix: bool) {
        let invalidation = CacheInvalidation {
            sender_id: self.node_id.clone(),
            key,
            is_prefix,
        };
        if let Err(error) = self.bus.publish(invalidation).await {
            tracing::warn!(%error, "Cache invalidation broadcast failed");
        }
    }
}

#[async_trait]
impl CacheBackend for HybridCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.local.get(key).await? {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        self.local_misses.fetch_add(1, Ordering::Relaxed);

        let value = self.shared.get(key).await?;
        if let Some(value) = &value {
            // Populate the local level; the shared TTL keeps authority.
            let ttl = self.shared.ttl(key).await?;
            self.local.set(key, value.clone(), ttl).await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.local.set(key, value.clone(), ttl).await?;
        self.shared.set(key, value, ttl).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(())
    }

    async fn add(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        // Set-if-absent is decided by the shared level.
        let stored = self.shared.add(key, value.clone(), ttl).await?;
        if stored {
            self.local.set(key, value, ttl).await?;
            self.broadcast(key.as_str(), false).await;
        }
        Ok(stored)
    }

    async fn replace_if_equal(
        &self,
        key: &CacheKey,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let replaced = self
            .shared
            .replace_if_equal(key, expected, value.clone(), ttl)
            .await?;
        if replaced {
            self.local.set(key, value, ttl).await?;
            self.broadcast(key.as_str(), false).await;
        }
        Ok(replaced)
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        self.local.remove(key).await?;
        let removed = self.shared.remove(key).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(removed)
    }

    async fn remove_if_equal(&self, key: &CacheKey, expected: &[u8]) -> Result<bool> {
        let removed = self.shared.remove_if_equal(key, expected).await?;
        if removed {
            self.local.remove(key).await?;
            self.broadcast(key.as_str(), false).await;
        }
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        self.local.remove_by_prefix(prefix).await?;
        let removed = self.shared.remove_by_prefix(prefix).await?;
        self.broadcast(prefix.to_string(), true).await;
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.local.clear().await?;
        self.shared.clear().await?;
        self.broadcast(String::new(), true).await;
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        if self.local.exists(key).await? {
            return Ok(true);
        }
        self.shared.exists(key).await
    }

    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>> {
        self.shared.ttl(key).await
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        self.local.expire(key, ttl).await?;
        self.shared.expire(key, ttl).await
    }

    async fn increment(&self, key: &CacheKey, delta: i64) -> Result<i64> {
        // Numeric state lives only in the shared level; a stale local copy
        // would corrupt counters.
        self.local.remove(key).await?;
        let value = self.shared.increment(key, delta).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(value)
    }

    async fn increment_with_expire(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64> {
        self.local.remove(key).await?;
        let value = self.shared.increment_with_expire(key, delta, ttl).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(value)
    }

    async fn set_if_higher(&self, key: &CacheKey, value: i64) -> Result<i64> {
        self.local.remove(key).await?;
        let stored = self.shared.set_if_higher(key, value).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(stored)
    }

    async fn set_if_lower(&self, key: &CacheKey, value: i64) -> Result<i64> {
        self.local.remove(key).await?;
        let stored = self.shared.set_if_lower(key, value).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(stored)
    }

    async fn list_add(
        &self,
        key: &CacheKey,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        self.local.remove(key).await?;
        let added = self.shared.list_add(key, values, ttl).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(added)
    }

    async fn list_remove(&self, key: &CacheKey, values: Vec<Vec<u8>>) -> Result<u64> {
        self.local.remove(key).await?;
        let removed = self.shared.list_remove(key, values).await?;
        self.broadcast(key.as_str(), false).await;
        Ok(removed)
    }

    async fn get_list(&self, key: &CacheKey) -> Result<Vec<Vec<u8>>> {
        self.shared.get_list(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCacheBackend;
    use plinth_messaging::InMemoryMessageBus;

    struct Node {
        backend: Arc<HybridCacheBackend>,
    }

    fn cluster(nodes: usize) -> (Vec<Node>, Arc<dyn CacheBackend>, Arc<dyn MessageBus>) {
        let shared: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());

        let nodes = (0..nodes)
            .map(|_| Node {
                backend: HybridCacheBackend::new(
                    Arc::new(InMemoryCacheBackend::new()),
                    shared.clone(),
                    bus.clone(),
                )
                .unwrap(),
            })
            .collect();
        (nodes, shared, bus)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_read_through_populates_local() {
        let (nodes, shared, _bus) = cluster(1);
        let node = &nodes[0].backend;
        let key = CacheKey::new("warm");

        shared.set(&key, b"value".to_vec(), None).await.unwrap();

        assert_eq!(node.get(&key).await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(node.local_misses(), 1);

        assert_eq!(node.get(&key).await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(node.local_hits(), 1, "second read served locally");
    }

    #[tokio::test]
    async fn test_write_invalidates_other_nodes() {
        let (nodes, _shared, _bus) = cluster(2);
        let key = CacheKey::new("shared-key");

        nodes[0]
            .backend
            .set(&key, b"v1".to_vec(), None)
            .await
            .unwrap();
        settle().await;

        // Node B reads v1 into its local level.
        assert_eq!(
            nodes[1].backend.get(&key).await.unwrap(),
            Some(b"v1".to_vec())
        );

        nodes[0]
            .backend
            .set(&key, b"v2".to_vec(), None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            nodes[1].backend.get(&key).await.unwrap(),
            Some(b"v2".to_vec()),
            "stale local copy was invalidated"
        );
    }

    #[tokio::test]
    async fn test_own_broadcast_keeps_local_copy() {
        let (nodes, _shared, _bus) = cluster(1);
        let node = &nodes[0].backend;
        let key = CacheKey::new("mine");

        node.set(&key, b"kept".to_vec(), None).await.unwrap();
        settle().await;

        let misses_before = node.local_misses();
        assert_eq!(node.get(&key).await.unwrap(), Some(b"kept".to_vec()));
        assert_eq!(
            node.local_misses(),
            misses_before,
            "writer's own local copy survives its broadcast"
        );
    }

    #[tokio::test]
    async fn test_remove_propagates() {
        let (nodes, _shared, _bus) = cluster(2);
        let key = CacheKey::new("gone");

        nodes[0]
            .backend
            .set(&key, b"v".to_vec(), None)
            .await
            .unwrap();
        settle().await;
        assert!(nodes[1].backend.get(&key).await.unwrap().is_some());

        nodes[1].backend.remove(&key).await.unwrap();
        settle().await;

        assert_eq!(nodes[0].backend.get(&key).await.unwrap(), None);
        assert_eq!(nodes[1].backend.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counters_live_in_shared_level() {
        let (nodes, _shared, _bus) = cluster(2);
        let key = CacheKey::new("counter");

        assert_eq!(nodes[0].backend.increment(&key, 2).await.unwrap(), 2);
        assert_eq!(nodes[1].backend.increment(&key, 3).await.unwrap(), 5);
        assert_eq!(nodes[0].backend.increment(&key, 1).await.unwrap(), 6);
    }
}
