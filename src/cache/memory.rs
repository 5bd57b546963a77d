//! In-process cache backend.
//!
//! Single-process stand-in for the Redis backend, used by tests and small
//! deployments that do not share aggregation state across processes.
//! Expiry is lazy: entries past their deadline are dropped when touched.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{decode, encode, CacheClient, CacheError};

enum Slot {
    Value(String),
    Set(HashSet<String>),
}

struct Entry {
    slot: Slot,
    deadline: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// DashMap-backed [`CacheClient`].
///
/// Atomicity of `increment`, `set_add`, and `set_remove` comes from the
/// map's per-entry locking.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries. Test helper.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheClient for MemoryCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        if entry.expired(Instant::now()) {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }

        match &entry.slot {
            Slot::Value(raw) => Ok(Some(decode(key, raw)?)),
            Slot::Set(_) => Err(CacheError::KindMismatch {
                key: key.to_string(),
            }),
        }
    }

    async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, value)?;
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(raw),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Value("0".to_string()),
            deadline: now + ttl,
        });

        if entry.expired(now) {
            entry.slot = Slot::Value("0".to_string());
        }

        let Slot::Value(raw) = &entry.slot else {
            return Err(CacheError::KindMismatch {
                key: key.to_string(),
            });
        };

        let current: i64 = decode(key, raw)?;
        let next = current.saturating_add(delta);
        entry.slot = Slot::Value(next.to_string());
        entry.deadline = now + ttl;

        Ok(next)
    }

    async fn set_add<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, member)?;
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Set(HashSet::new()),
            deadline: now + ttl,
        });

        if entry.expired(now) {
            entry.slot = Slot::Set(HashSet::new());
        }

        let Slot::Set(members) = &mut entry.slot else {
            return Err(CacheError::KindMismatch {
                key: key.to_string(),
            });
        };

        members.insert(raw);
        entry.deadline = now + ttl;

        Ok(())
    }

    async fn set_remove<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, member)?;
        let now = Instant::now();

        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(());
        };

        if entry.expired(now) {
            drop(entry);
            self.entries.remove(key);
            return Ok(());
        }

        let Slot::Set(members) = &mut entry.slot else {
            return Err(CacheError::KindMismatch {
                key: key.to_string(),
            });
        };

        members.remove(&raw);
        entry.deadline = now + ttl;

        Ok(())
    }

    async fn get_set<T: DeserializeOwned + Eq + Hash>(
        &self,
        key: &str,
    ) -> Result<Option<HashSet<T>>, CacheError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        if entry.expired(Instant::now()) {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }

        let Slot::Set(members) = &entry.slot else {
            return Err(CacheError::KindMismatch {
                key: key.to_string(),
            });
        };

        if members.is_empty() {
            return Ok(None);
        }

        let mut out = HashSet::with_capacity(members.len());
        for raw in members {
            out.insert(decode(key, raw)?);
        }

        Ok(Some(out))
    }

    async fn remove_all(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}
