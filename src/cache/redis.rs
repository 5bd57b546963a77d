//! Redis cache backend.
//!
//! Production [`CacheClient`] over a shared Redis instance. INCRBY and
//! SADD/SREM give the atomicity the aggregator depends on; every write is
//! pipelined with an EXPIRE so the TTL always lands together with the data.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::config::CacheConfig;

use super::{decode, encode, CacheClient, CacheError};

/// Redis-backed [`CacheClient`].
///
/// Holds a multiplexed connection manager; clones of it share one
/// underlying connection and reconnect transparently.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to the configured Redis endpoint and verify it with a ping.
    pub async fn connect(cfg: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.endpoint.as_str())
            .with_context(|| format!("parsing redis endpoint {}", cfg.endpoint))?;

        let conn = client
            .get_connection_manager()
            .await
            .context("opening redis connection")?;

        let mut probe = conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut probe)
            .await
            .context("pinging redis")?;

        info!(endpoint = %cfg.endpoint, "redis cache connected");

        Ok(Self { conn })
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

impl CacheClient for RedisCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;

        match raw {
            Some(raw) => Ok(Some(decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, raw, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, delta)
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_add<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, member)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(key, raw)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove<T: Serialize + Sync>(
        &self,
        key: &str,
        member: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(key, member)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .srem(key, raw)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_set<T: DeserializeOwned + Eq + Hash>(
        &self,
        key: &str,
    ) -> Result<Option<HashSet<T>>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(key).await?;

        if raw.is_empty() {
            return Ok(None);
        }

        let mut out = HashSet::with_capacity(raw.len());
        for member in &raw {
            out.insert(decode(key, member)?);
        }

        Ok(Some(out))
    }

    async fn remove_all(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}
