//! # Plinth Cache
//!
//! Pluggable cache surface: a byte-level backend contract with the atomic
//! primitives the lock providers depend on, a typed wrapper, and a two-level
//! hybrid backend kept coherent over the message bus.

pub mod backend;
pub mod cache;
pub mod hybrid;
pub mod key;

pub use backend::{CacheBackend, InMemoryCacheBackend, NullCacheBackend};
pub use cache::{Cache, CacheConfig};
pub use hybrid::{CacheInvalidation, HybridCacheBackend};
pub use key::CacheKey;
