//! High-level typed cache API.

use crate::backend::CacheBackend;
use crate::key::CacheKey;
use plinth_core::error::Result;
use plinth_core::serializer::Serializer;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default TTL for cache entries; None = no expiration
    pub default_ttl: Option<Duration>,
    /// Key prefix for namespacing
    pub prefix: Option<String>,
    /// Codec used to encode values
    pub serializer: Serializer,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            prefix: None,
            serializer: Serializer::Json,
        }
    }
}

/// Typed cache interface over a byte-level backend
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl Cache {
    /// Create a new cache with the given backend
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            config: CacheConfig::default(),
        }
    }

    /// Create a cache with custom configuration
    pub fn with_config(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// A view of the same backend under an additional key prefix
    pub fn scoped(&self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let combined = match &self.config.prefix {
            Some(existing) => format!("{}:{}", existing, prefix),
            None => prefix,
        };
        Self {
            backend: self.backend.clone(),
            config: CacheConfig {
                prefix: Some(combined),
                ..self.config.clone()
            },
        }
    }

    /// The underlying byte-level backend
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    fn full_key(&self, key: &CacheKey) -> CacheKey {
        match &self.config.prefix {
            Some(prefix) => key.prefix(prefix),
            None => key.clone(),
        }
    }

    /// Get a value from the cache
    pub async fn get<T: DeserializeOwned>(&self, key: impl Into<CacheKey>) -> Result<Option<T>> {
        let key = self.full_key(&key.into());
        match self.backend.get(&key).await? {
            Some(bytes) => Ok(Some(self.config.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set a value in the cache
    pub async fn set<T: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.full_key(&key.into());
        let bytes = self.config.serializer.serialize(value)?;
        let ttl = ttl.or(self.config.default_ttl);
        self.backend.set(&key, bytes, ttl).await
    }

    /// Set a value only if the key is absent
    pub async fn add<T: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let key = self.full_key(&key.into());
        let bytes = self.config.serializer.serialize(value)?;
        let ttl = ttl.or(self.config.default_ttl);
        self.backend.add(&key, bytes, ttl).await
    }

    /// Get a value or compute and store it if not present
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let key = key.into();
        if let Some(value) = self.get::<T>(key.clone()).await? {
            return Ok(value);
        }

        let value = f().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    /// Delete a value from the cache
    pub async fn remove(&self, key: impl Into<CacheKey>) -> Result<bool> {
        let key = self.full_key(&key.into());
        self.backend.remove(&key).await
    }

    /// Check if a key exists
    pub async fn exists(&self, key: impl Into<CacheKey>) -> Result<bool> {
        let key = self.full_key(&key.into());
        self.backend.exists(&key).await
    }

    /// Set the expiration of an existing key
    pub async fn expire(&self, key: impl Into<CacheKey>, ttl: Duration) -> Result<()> {
        let key = self.full_key(&key.into());
        self.backend.expire(&key, ttl).await
    }

    /// Remaining TTL of a key
    pub async fn ttl(&self, key: impl Into<CacheKey>) -> Result<Option<Duration>> {
        let key = self.full_key(&key.into());
        self.backend.ttl(&key).await
    }

    /// Increment a numeric value
    pub async fn increment(&self, key: impl Into<CacheKey>, delta: i64) -> Result<i64> {
        let key = self.full_key(&key.into());
        self.backend.increment(&key, delta).await
    }

    /// Increment a numeric value and refresh its expiration
    pub async fn increment_with_expire(
        &self,
        key: impl Into<CacheKey>,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64> {
        let key = self.full_key(&key.into());
        self.backend.increment_with_expire(&key, delta, ttl).await
    }

    /// Store `value` if higher than the current numeric value
    pub async fn set_if_higher(&self, key: impl Into<CacheKey>, value: i64) -> Result<i64> {
        let key = self.full_key(&key.into());
        self.backend.set_if_higher(&key, value).await
    }

    /// Store `value` if lower than the current numeric value
    pub async fn set_if_lower(&self, key: impl Into<CacheKey>, value: i64) -> Result<i64> {
        let key = self.full_key(&key.into());
        self.backend.set_if_lower(&key, value).await
    }

    /// Add values to the typed set stored at `key`
    pub async fn list_add<T: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        values: &[T],
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let key = self.full_key(&key.into());
        let encoded = values
            .iter()
            .map(|v| self.config.serializer.serialize(v))
            .collect::<Result<Vec<_>>>()?;
        self.backend.list_add(&key, encoded, ttl).await
    }

    /// Remove values from the typed set stored at `key`
    pub async fn list_remove<T: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        values: &[T],
    ) -> Result<u64> {
        let key = self.full_key(&key.into());
        let encoded = values
            .iter()
            .map(|v| self.config.serializer.serialize(v))
            .collect::<Result<Vec<_>>>()?;
        self.backend.list_remove(&key, encoded).await
    }

    /// Read the typed set stored at `key`
    pub async fn get_list<T: DeserializeOwned>(&self, key: impl Into<CacheKey>) -> Result<Vec<T>> {
        let key = self.full_key(&key.into());
        self.backend
            .get_list(&key)
            .await?
            .iter()
            .map(|bytes| self.config.serializer.deserialize(bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCacheBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
        label: String,
    }

    fn cache() -> Cache {
        Cache::new(Arc::new(InMemoryCacheBackend::new()))
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let cache = cache();
        let widget = Widget {
            id: 1,
            label: "gear".into(),
        };

        cache.set("widget:1", &widget, None).await.unwrap();
        let loaded: Widget = cache.get("widget:1").await.unwrap().unwrap();
        assert_eq!(loaded, widget);
    }

    #[tokio::test]
    async fn test_get_or_set_computes_once() {
        let cache = cache();

        let first: u32 = cache
            .get_or_set("answer", None, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(first, 42);

        let second: u32 = cache
            .get_or_set("answer", None, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(second, 42, "cached value wins");
    }

    #[tokio::test]
    async fn test_scoped_prefix_isolates_keys() {
        let cache = cache();
        let scoped = cache.scoped("tenant-a");

        scoped.set("value", &1u32, None).await.unwrap();
        assert_eq!(cache.get::<u32>("value").await.unwrap(), None);
        assert_eq!(scoped.get::<u32>("value").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_typed_list() {
        let cache = cache();

        cache
            .list_add("ids", &[1u32, 2, 3], None)
            .await
            .unwrap();
        cache.list_remove("ids", &[2u32]).await.unwrap();

        let mut ids: Vec<u32> = cache.get_list("ids").await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_messagepack_config() {
        let config = CacheConfig {
            serializer: Serializer::MessagePack,
            ..Default::default()
        };
        let cache = Cache::with_config(Arc::new(InMemoryCacheBackend::new()), config);

        let widget = Widget {
            id: 9,
            label: "binary".into(),
        };
        cache.set("w", &widget, None).await.unwrap();
        assert_eq!(cache.get::<Widget>("w").await.unwrap(), Some(widget));
    }
}
