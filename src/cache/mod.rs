//! Aggregation cache client.
//!
//! The aggregator keeps all pending state in an external key-value cache so
//! that it survives process restarts and is shared across producer
//! processes. The cache must provide atomic increment and atomic set
//! add/remove; those two primitives are what make concurrent recording
//! lose-free. No transactional multi-key guarantee is assumed.

pub mod memory;
pub mod redis;

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Errors surfaced by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis command failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("decoding cached value at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("key {key} holds a different value kind")]
    KindMismatch { key: String },
}

/// Key-value cache with TTL expiry, atomic increment, and set membership.
///
/// Values round-trip through JSON so both implementations store the same
/// representation. Counter cells written by `increment` are plain integers
/// and readable via `get::<i64>`.
pub trait CacheClient: Send + Sync {
    /// Read a value. Absent or expired keys yield `None`.
    fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<T>, CacheError>> + Send;

    /// Write a value, replacing any previous one and resetting its TTL.
    fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Atomically add `delta` to a counter, creating it at `delta` when
    /// absent. Resets the TTL and returns the new value.
    fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<i64, CacheError>> + Send;

    /// Atomically add a member to a set, refreshing the set's TTL.
    fn set_add<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Atomically remove a member from a set, refreshing the set's TTL.
    fn set_remove<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Read all members of a set. Absent, expired, or empty sets yield
    /// `None`.
    fn get_set<T: DeserializeOwned + Eq + Hash>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<HashSet<T>>, CacheError>> + Send;

    /// Remove the given keys. Missing keys are not an error.
    fn remove_all(
        &self,
        keys: &[String],
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|source| CacheError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, CacheError> {
    serde_json::from_str(raw).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}
