//! Cache backend implementations.
//!
//! Backends speak bytes; typed access goes through [`crate::Cache`]. Besides
//! plain get/set the contract carries the atomic primitives the lock providers
//! build on: set-if-absent, compare-and-replace, compare-and-remove and the
//! numeric increment family.

use crate::key::CacheKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use plinth_core::clock::{Clock, SystemClock};
use plinth_core::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Cache backend trait
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the cache
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    /// Set a value in the cache with optional TTL
    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Set a value only if the key is absent; returns whether the value was stored
    async fn add(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Replace the value only if the current value equals `expected`
    async fn replace_if_equal(
        &self,
        key: &CacheKey,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Delete a value from the cache
    async fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Delete the value only if the current value equals `expected`
    async fn remove_if_equal(&self, key: &CacheKey, expected: &[u8]) -> Result<bool>;

    /// Delete all keys starting with `prefix`; returns the number removed
    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64>;

    /// Clear all cache entries
    async fn clear(&self) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &CacheKey) -> Result<bool>;

    /// Get remaining TTL for a key
    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>>;

    /// Set the expiration of an existing key
    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<()>;

    /// Increment a numeric value, creating it at zero when absent
    async fn increment(&self, key: &CacheKey, delta: i64) -> Result<i64>;

    /// Increment a numeric value and refresh its expiration in one step
    async fn increment_with_expire(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64>;

    /// Store `value` only if it is higher than the current numeric value;
    /// returns the stored value
    async fn set_if_higher(&self, key: &CacheKey, value: i64) -> Result<i64>;

    /// Store `value` only if it is lower than the current numeric value;
    /// returns the stored value
    async fn set_if_lower(&self, key: &CacheKey, value: i64) -> Result<i64>;

    /// Add values to the set stored at `key`; returns the number actually added
    async fn list_add(
        &self,
        key: &CacheKey,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<u64>;

    /// Remove values from the set stored at `key`; returns the number removed
    async fn list_remove(&self, key: &CacheKey, values: Vec<Vec<u8>>) -> Result<u64>;

    /// Get all values of the set stored at `key`
    async fn get_list(&self, key: &CacheKey) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone)]
enum StoredData {
    Bytes(Vec<u8>),
    List(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: StoredData,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl StoredValue {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }

    fn as_int(&self) -> i64 {
        match &self.data {
            StoredData::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0),
            StoredData::List(_) => 0,
        }
    }
}

/// In-memory cache backend
///
/// Reference implementation for tests and single-process deployments. Per-key
/// TTLs are honoured lazily on access; when `max_items` is set the oldest
/// entry is evicted first.
pub struct InMemoryCacheBackend {
    entries: DashMap<String, StoredValue>,
    max_items: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_items: None,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of live entries
    pub fn item_count(&self) -> usize {
        let now = self.clock.utc_now();
        self.entries.iter().filter(|e| !e.expired(now)).count()
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|t| self.clock.utc_now() + chrono::Duration::from_std(t).unwrap_or_default())
    }

    fn stored(&self, data: StoredData, ttl: Option<Duration>) -> StoredValue {
        StoredValue {
            data,
            expires_at: self.expires_at(ttl),
            created_at: self.clock.utc_now(),
        }
    }

    /// Read a live value, dropping it if its TTL has lapsed
    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = self.clock.utc_now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expired(now) => true,
            Some(entry) => return Some(entry.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Make room for one more entry when a cap is configured. Expired entries
    /// go first, then the oldest by creation time (linear scan; the in-memory
    /// backend is not built for large capped stores).
    fn make_room(&self, inserting: &str) {
        let Some(max) = self.max_items else { return };
        if self.entries.contains_key(inserting) || self.entries.len() < max {
            return;
        }

        let now = self.clock.utc_now();
        let victim = self
            .entries
            .iter()
            .filter(|e| e.key().as_str() != inserting)
            .min_by_key(|e| {
                if e.expired(now) {
                    (0, e.created_at)
                } else {
                    (1, e.created_at)
                }
            })
            .map(|e| e.key().clone());

        if let Some(victim) = victim {
            self.entries.remove(&victim);
        }
    }

    fn mutate_int(
        &self,
        key: &CacheKey,
        expire: Option<Duration>,
        f: impl FnOnce(Option<i64>) -> i64,
    ) -> i64 {
        let key = key.as_str();
        self.make_room(&key);
        let now = self.clock.utc_now();

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().expired(now) {
                    None
                } else {
                    Some(occupied.get().as_int())
                };
                let next = f(current);
                let value = occupied.get_mut();
                value.data = StoredData::Bytes(next.to_string().into_bytes());
                if current.is_none() || expire.is_some() {
                    value.expires_at = self.expires_at(expire);
                }
                next
            }
            Entry::Vacant(vacant) => {
                let next = f(None);
                vacant.insert(self.stored(
                    StoredData::Bytes(next.to_string().into_bytes()),
                    expire,
                ));
                next
            }
        }
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.live(&key.as_str()).and_then(|v| match v.data {
            StoredData::Bytes(b) => Some(b),
            StoredData::List(_) => None,
        }))
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let key = key.as_str();
        self.make_room(&key);
        self.entries
            .insert(key, self.stored(StoredData::Bytes(value), ttl));
        Ok(())
    }

    async fn add(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let key = key.as_str();
        self.make_room(&key);
        let now = self.clock.utc_now();

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) if occupied.get().expired(now) => {
                occupied.insert(self.stored(StoredData::Bytes(value), ttl));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(self.stored(StoredData::Bytes(value), ttl));
                Ok(true)
            }
        }
    }

    async fn replace_if_equal(
        &self,
        key: &CacheKey,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = self.clock.utc_now();
        match self.entries.entry(key.as_str()) {
            Entry::Occupied(mut occupied) => {
                let matches = !occupied.get().expired(now)
                    && matches!(&occupied.get().data, StoredData::Bytes(b) if b == expected);
                if matches {
                    occupied.insert(self.stored(StoredData::Bytes(value), ttl));
                }
                Ok(matches)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let now = self.clock.utc_now();
        Ok(self
            .entries
            .remove(&key.as_str())
            .map(|(_, v)| !v.expired(now))
            .unwrap_or(false))
    }

    async fn remove_if_equal(&self, key: &CacheKey, expected: &[u8]) -> Result<bool> {
        let now = self.clock.utc_now();
        match self.entries.entry(key.as_str()) {
            Entry::Occupied(occupied) => {
                let matches = !occupied.get().expired(now)
                    && matches!(&occupied.get().data, StoredData::Bytes(b) if b == expected);
                if matches {
                    occupied.remove();
                }
                Ok(matches)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.live(&key.as_str()).is_some())
    }

    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>> {
        let now = self.clock.utc_now();
        Ok(self
            .live(&key.as_str())
            .and_then(|v| v.expires_at)
            .and_then(|e| (e - now).to_std().ok()))
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        let expires_at = self.expires_at(Some(ttl));
        if let Some(mut entry) = self.entries.get_mut(&key.as_str()) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    async fn increment(&self, key: &CacheKey, delta: i64) -> Result<i64> {
        Ok(self.mutate_int(key, None, |cur| cur.unwrap_or(0) + delta))
    }

    async fn increment_with_expire(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64> {
        Ok(self.mutate_int(key, Some(ttl), |cur| cur.unwrap_or(0) + delta))
    }

    async fn set_if_higher(&self, key: &CacheKey, value: i64) -> Result<i64> {
        Ok(self.mutate_int(key, None, |cur| match cur {
            Some(cur) if cur >= value => cur,
            _ => value,
        }))
    }

    async fn set_if_lower(&self, key: &CacheKey, value: i64) -> Result<i64> {
        Ok(self.mutate_int(key, None, |cur| match cur {
            Some(cur) if cur <= value => cur,
            _ => value,
        }))
    }

    async fn list_add(
        &self,
        key: &CacheKey,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let key = key.as_str();
        self.make_room(&key);
        let now = self.clock.utc_now();
        let expires_at = self.expires_at(ttl);

        let mut added = 0;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now) {
                    occupied.insert(self.stored(StoredData::List(Vec::new()), ttl));
                }
                let value = occupied.get_mut();
                if ttl.is_some() {
                    value.expires_at = expires_at;
                }
                if let StoredData::List(items) = &mut value.data {
                    for v in values {
                        if !items.contains(&v) {
                            items.push(v);
                            added += 1;
                        }
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut items = Vec::new();
                for v in values {
                    if !items.contains(&v) {
                        items.push(v);
                        added += 1;
                    }
                }
                vacant.insert(self.stored(StoredData::List(items), ttl));
            }
        }
        Ok(added)
    }

    async fn list_remove(&self, key: &CacheKey, values: Vec<Vec<u8>>) -> Result<u64> {
        let mut removed = 0;
        if let Some(mut entry) = self.entries.get_mut(&key.as_str()) {
            if let StoredData::List(items) = &mut entry.data {
                let before = items.len();
                items.retain(|v| !values.contains(v));
                removed = (before - items.len()) as u64;
            }
        }
        Ok(removed)
    }

    async fn get_list(&self, key: &CacheKey) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .live(&key.as_str())
            .and_then(|v| match v.data {
                StoredData::List(items) => Some(items),
                StoredData::Bytes(_) => None,
            })
            .unwrap_or_default())
    }
}

/// Null cache backend (no-op)
pub struct NullCacheBackend;

#[async_trait]
impl CacheBackend for NullCacheBackend {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn add(&self, _key: &CacheKey, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
        Ok(true)
    }

    async fn replace_if_equal(
        &self,
        _key: &CacheKey,
        _expected: &[u8],
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn remove(&self, _key: &CacheKey) -> Result<bool> {
        Ok(false)
    }

    async fn remove_if_equal(&self, _key: &CacheKey, _expected: &[u8]) -> Result<bool> {
        Ok(false)
    }

    async fn remove_by_prefix(&self, _prefix: &str) -> Result<u64> {
        Ok(0)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &CacheKey) -> Result<bool> {
        Ok(false)
    }

    async fn ttl(&self, _key: &CacheKey) -> Result<Option<Duration>> {
        Ok(None)
    }

    async fn expire(&self, _key: &CacheKey, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn increment(&self, _key: &CacheKey, delta: i64) -> Result<i64> {
        Ok(delta)
    }

    async fn increment_with_expire(
        &self,
        _key: &CacheKey,
        delta: i64,
        _ttl: Duration,
    ) -> Result<i64> {
        Ok(delta)
    }

    async fn set_if_higher(&self, _key: &CacheKey, value: i64) -> Result<i64> {
        Ok(value)
    }

    async fn set_if_lower(&self, _key: &CacheKey, value: i64) -> Result<i64> {
        Ok(value)
    }

    async fn list_add(
        &self,
        _key: &CacheKey,
        values: Vec<Vec<u8>>,
        _ttl: Option<Duration>,
    ) -> Result<u64> {
        Ok(values.len() as u64)
    }

    async fn list_remove(&self, _key: &CacheKey, values: Vec<Vec<u8>>) -> Result<u64> {
        Ok(values.len() as u64)
    }

    async fn get_list(&self, _key: &CacheKey) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}
