//! Cache key generation and management.

use std::fmt;

/// A cache key with namespace support
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Option<String>,
    key: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            namespace: None,
            key: key.into(),
        }
    }

    /// Create a cache key with namespace
    pub fn with_namespace(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            key: key.into(),
        }
    }

    /// Get the full cache key string
    pub fn as_str(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, self.key),
            None => self.key.clone(),
        }
    }

    /// Add a prefix to the key
    pub fn prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            key: format!("{}:{}", prefix.into(), self.key),
        }
    }

    /// Add a suffix to the key
    pub fn suffix(&self, suffix: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            key: format!("{}:{}", self.key, suffix.into()),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&String> for CacheKey {
    fn from(s: &String) -> Self {
        Self::new(s.clone())
    }
}
