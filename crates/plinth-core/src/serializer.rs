//! Pluggable value ↔ bytes codec.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Wire codec used wherever a component persists or transports typed values.
///
/// Components carry a `Serializer` in their options and never assume a
/// particular encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    /// Human-readable JSON via serde_json
    #[default]
    Json,
    /// Compact binary MessagePack via rmp-serde
    MessagePack,
}

impl Serializer {
    /// Encode a value to bytes
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Json => serde_json::to_vec(value)
                .map_err(|e| Error::serialization(format!("JSON encode failed: {}", e))),
            Serializer::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| Error::serialization(format!("MessagePack encode failed: {}", e))),
        }
    }

    /// Decode a value from bytes
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Serializer::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::serialization(format!("JSON decode failed: {}", e))),
            Serializer::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| Error::serialization(format!("MessagePack decode failed: {}", e))),
        }
    }
}
