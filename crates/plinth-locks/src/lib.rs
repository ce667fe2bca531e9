//! # Plinth Locks
//!
//! Distributed lock providers consumed by the job runtime and queue
//! consumers: a cache-backed provider with owner-checked release/renew and a
//! throttling variant admitting at most N acquires per period.

pub mod cache_lock;
pub mod provider;
pub mod throttling;

pub use cache_lock::CacheLockProvider;
pub use provider::{
    Lock, LockProvider, LockProviderExt, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LOCK_TIMEOUT,
};
pub use throttling::ThrottlingLockProvider;
