//! Write-coalescing occurrence aggregation.
//!
//! [`OccurrenceService::record_occurrence`] folds occurrence events into
//! per-entity cache cells (count, min/max occurrence time) and marks the
//! entity dirty. [`OccurrenceService::flush_all`] drains the dirty set,
//! forwarding each entity's aggregated window to the durable store and
//! clearing its cells. Producers and the flush job coordinate only through
//! the cache's atomic primitives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::cache::CacheClient;
use crate::export::health::HealthMetrics;
use crate::store::EventStore;

/// Dirty set of entities with pending, unflushed aggregation state.
pub const OCCURRENCE_SET_KEY: &str = "usage:occurrences";

/// Identifies one aggregation target.
///
/// Doubles as the cache-key suffix for the per-entity cells and as the
/// dirty-set member (JSON-encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub organization_id: String,
    pub project_id: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            entity_id: entity_id.into(),
        }
    }

    /// True when any identifier is empty; such keys are never cached.
    fn is_blank(&self) -> bool {
        self.organization_id.is_empty()
            || self.project_id.is_empty()
            || self.entity_id.is_empty()
    }

    /// Running occurrence count since the last flush.
    pub fn count_key(&self) -> String {
        format!(
            "usage:occurrences:count:{}:{}:{}",
            self.organization_id, self.project_id, self.entity_id
        )
    }

    /// Earliest occurrence timestamp since the last flush.
    pub fn min_date_key(&self) -> String {
        format!(
            "usage:occurrences:mindate:{}:{}:{}",
            self.organization_id, self.project_id, self.entity_id
        )
    }

    /// Latest occurrence timestamp since the last flush.
    pub fn max_date_key(&self) -> String {
        format!(
            "usage:occurrences:maxdate:{}:{}:{}",
            self.organization_id, self.project_id, self.entity_id
        )
    }
}

/// Coalescing aggregator and flush driver over a shared cache.
pub struct OccurrenceService<C, S> {
    cache: C,
    store: S,
    key_ttl: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<C, S> OccurrenceService<C, S>
where
    C: CacheClient,
    S: EventStore,
{
    /// Create a new service. `key_ttl` bounds how long unflushed
    /// aggregation state survives in the cache.
    pub fn new(cache: C, store: S, key_ttl: Duration) -> Self {
        Self {
            cache,
            store,
            key_ttl,
            health: None,
        }
    }

    /// Attach health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Borrow the underlying cache. Test helper.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Fold one occurrence window into the entity's pending aggregation.
    ///
    /// Empty identifiers or a zero count are a silent no-op. Otherwise four
    /// cache updates are issued concurrently and jointly awaited: a
    /// conditional lower of the min bound, a conditional raise of the max
    /// bound, an atomic increment of the count, and a dirty-set add. The
    /// count increment is race-free under concurrent producers; the bound
    /// updates are read-then-write and a concurrent caller may win with a
    /// less tight bound. Every touched cell gets a fresh TTL.
    ///
    /// The first cache failure fails the whole call; sub-operations that
    /// already landed are not rolled back, so a failed call may still leave
    /// the entity dirty.
    pub async fn record_occurrence(
        &self,
        organization_id: &str,
        project_id: &str,
        entity_id: &str,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        count: i64,
    ) -> Result<()> {
        let key = EntityKey::new(organization_id, project_id, entity_id);
        if key.is_blank() || count == 0 {
            return Ok(());
        }

        let count_key = key.count_key();
        let min_key = key.min_date_key();
        let max_key = key.max_date_key();

        let bounds = tokio::try_join!(
            self.cache.get::<DateTime<Utc>>(&min_key),
            self.cache.get::<DateTime<Utc>>(&max_key),
        );
        if bounds.is_err() {
            if let Some(health) = &self.health {
                health.cache_errors.inc();
            }
        }
        let (cached_min, cached_max) = bounds.context("reading occurrence bounds")?;

        let lower_min = async {
            match cached_min {
                Some(current) if current <= min_time => Ok(()),
                _ => self.cache.set(&min_key, &min_time, self.key_ttl).await,
            }
        };

        let raise_max = async {
            match cached_max {
                Some(current) if current >= max_time => Ok(()),
                _ => self.cache.set(&max_key, &max_time, self.key_ttl).await,
            }
        };

        let add_count = self.cache.increment(&count_key, count, self.key_ttl);
        let mark_dirty = self.cache.set_add(OCCURRENCE_SET_KEY, &key, self.key_ttl);

        let result = tokio::try_join!(lower_min, raise_max, add_count, mark_dirty);
        if result.is_err() {
            if let Some(health) = &self.health {
                health.cache_errors.inc();
            }
        }
        result.context("recording occurrence")?;

        if let Some(health) = &self.health {
            health.occurrences_recorded.inc_by(count as f64);
        }

        Ok(())
    }

    /// Drain the dirty set, applying each entity's aggregated window to the
    /// durable store and clearing its cache state.
    ///
    /// The pass iterates a snapshot of the dirty set taken at the start of
    /// the call; an absent or empty set returns immediately. Cancellation
    /// is checked at the top of each iteration, so an entity that has
    /// started flushing always finishes.
    ///
    /// A zero or expired count cell terminates the remaining pass, not just
    /// that entity; later entities are picked up by the next scheduled
    /// pass. A missing bound cell falls back to the current wall-clock
    /// time so it never blocks the flush. The store write, the cell
    /// removal, and the dirty-set removal for one entity are issued
    /// concurrently; a failure in any of them aborts the pass. Effects that
    /// already landed are not rolled back, and whatever is still dirty is
    /// retried by the next pass.
    pub async fn flush_all(
        &self,
        send_notifications: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dirty = self
            .cache
            .get_set::<EntityKey>(OCCURRENCE_SET_KEY)
            .await
            .context("reading dirty set")?;

        let Some(dirty) = dirty else {
            return Ok(());
        };

        for key in dirty {
            if cancel.is_cancelled() {
                break;
            }

            let count_key = key.count_key();
            let min_key = key.min_date_key();
            let max_key = key.max_date_key();

            let count: i64 = self
                .cache
                .get(&count_key)
                .await
                .with_context(|| format!("reading {count_key}"))?
                .unwrap_or(0);
            if count == 0 {
                return Ok(());
            }

            let (min_date, max_date) = tokio::try_join!(
                self.cache.get::<DateTime<Utc>>(&min_key),
                self.cache.get::<DateTime<Utc>>(&max_key),
            )
            .context("reading occurrence bounds")?;

            let min_date = min_date.unwrap_or_else(Utc::now);
            let max_date = max_date.unwrap_or_else(Utc::now);

            let store_write = self.store.increment_event_counter(
                &key,
                min_date,
                max_date,
                count,
                send_notifications,
            );
            let clear_cells = async {
                self.cache
                    .remove_all(&[count_key, min_key, max_key])
                    .await
                    .map_err(anyhow::Error::from)
            };
            let clear_dirty = async {
                self.cache
                    .set_remove(OCCURRENCE_SET_KEY, &key, self.key_ttl)
                    .await
                    .map_err(anyhow::Error::from)
            };

            tokio::try_join!(store_write, clear_cells, clear_dirty).with_context(|| {
                format!(
                    "flushing {}:{}:{}",
                    key.organization_id, key.project_id, key.entity_id
                )
            })?;

            if let Some(health) = &self.health {
                health.entities_flushed.inc();
            }

            trace!(
                organization = %key.organization_id,
                project = %key.project_id,
                entity = %key.entity_id,
                count,
                min_date = %min_date,
                max_date = %max_date,
                "entity usage flushed"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    /// Store double that fails the test if the flush driver reaches it.
    struct UnreachableStore;

    impl EventStore for UnreachableStore {
        async fn increment_event_counter(
            &self,
            _key: &EntityKey,
            _min: DateTime<Utc>,
            _max: DateTime<Utc>,
            _count: i64,
            _send_notifications: bool,
        ) -> Result<()> {
            panic!("store should not be reached");
        }
    }

    fn service() -> OccurrenceService<MemoryCache, UnreachableStore> {
        OccurrenceService::new(
            MemoryCache::new(),
            UnreachableStore,
            Duration::from_secs(86_400),
        )
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        rfc3339.parse().expect("should parse timestamp")
    }

    #[test]
    fn test_cache_key_scheme() {
        let key = EntityKey::new("org1", "proj1", "ent1");

        assert_eq!(key.count_key(), "usage:occurrences:count:org1:proj1:ent1");
        assert_eq!(
            key.min_date_key(),
            "usage:occurrences:mindate:org1:proj1:ent1"
        );
        assert_eq!(
            key.max_date_key(),
            "usage:occurrences:maxdate:org1:proj1:ent1"
        );
        assert_eq!(OCCURRENCE_SET_KEY, "usage:occurrences");
    }

    #[tokio::test]
    async fn test_zero_count_is_a_noop() {
        let svc = service();
        let t = at("2024-03-01T12:00:00Z");

        svc.record_occurrence("org1", "proj1", "ent1", t, t, 0)
            .await
            .expect("should succeed");

        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn test_blank_identifier_is_a_noop() {
        let svc = service();
        let t = at("2024-03-01T12:00:00Z");

        svc.record_occurrence("", "proj1", "ent1", t, t, 5)
            .await
            .expect("should succeed");
        svc.record_occurrence("org1", "", "ent1", t, t, 5)
            .await
            .expect("should succeed");
        svc.record_occurrence("org1", "proj1", "", t, t, 5)
            .await
            .expect("should succeed");

        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn test_record_creates_all_four_cells() {
        let svc = service();
        let key = EntityKey::new("org1", "proj1", "ent1");
        let t = at("2024-03-01T12:00:00Z");

        svc.record_occurrence("org1", "proj1", "ent1", t, t, 5)
            .await
            .expect("should succeed");

        let count: Option<i64> = svc
            .cache()
            .get(&key.count_key())
            .await
            .expect("should succeed");
        assert_eq!(count, Some(5));

        let min: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.min_date_key())
            .await
            .expect("should succeed");
        assert_eq!(min, Some(t));

        let max: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.max_date_key())
            .await
            .expect("should succeed");
        assert_eq!(max, Some(t));

        let dirty = svc
            .cache()
            .get_set::<EntityKey>(OCCURRENCE_SET_KEY)
            .await
            .expect("should succeed")
            .expect("dirty set should exist");
        assert!(dirty.contains(&key));
    }

    #[tokio::test]
    async fn test_sequential_records_accumulate_and_widen_bounds() {
        let svc = service();
        let key = EntityKey::new("org1", "proj1", "ent1");
        let t0 = at("2024-03-01T12:00:00Z");
        let earlier = at("2024-03-01T11:00:00Z");
        let later = at("2024-03-01T13:00:00Z");

        svc.record_occurrence("org1", "proj1", "ent1", t0, t0, 5)
            .await
            .expect("should succeed");
        svc.record_occurrence("org1", "proj1", "ent1", earlier, later, 3)
            .await
            .expect("should succeed");

        let count: Option<i64> = svc
            .cache()
            .get(&key.count_key())
            .await
            .expect("should succeed");
        assert_eq!(count, Some(8));

        let min: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.min_date_key())
            .await
            .expect("should succeed");
        assert_eq!(min, Some(earlier));

        let max: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.max_date_key())
            .await
            .expect("should succeed");
        assert_eq!(max, Some(later));
    }

    #[tokio::test]
    async fn test_narrower_bounds_do_not_overwrite() {
        let svc = service();
        let key = EntityKey::new("org1", "proj1", "ent1");
        let wide_min = at("2024-03-01T10:00:00Z");
        let wide_max = at("2024-03-01T14:00:00Z");
        let narrow = at("2024-03-01T12:00:00Z");

        svc.record_occurrence("org1", "proj1", "ent1", wide_min, wide_max, 1)
            .await
            .expect("should succeed");
        svc.record_occurrence("org1", "proj1", "ent1", narrow, narrow, 1)
            .await
            .expect("should succeed");

        let min: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.min_date_key())
            .await
            .expect("should succeed");
        assert_eq!(min, Some(wide_min));

        let max: Option<DateTime<Utc>> = svc
            .cache()
            .get(&key.max_date_key())
            .await
            .expect("should succeed");
        assert_eq!(max, Some(wide_max));
    }

    #[tokio::test]
    async fn test_flush_with_empty_dirty_set_never_reaches_store() {
        let svc = service();
        let cancel = CancellationToken::new();

        svc.flush_all(true, &cancel)
            .await
            .expect("should succeed without store calls");
    }

    #[tokio::test]
    async fn test_flush_cancelled_before_start_never_reaches_store() {
        let svc = service();
        let t = at("2024-03-01T12:00:00Z");

        svc.record_occurrence("org1", "proj1", "ent1", t, t, 5)
            .await
            .expect("should succeed");

        let cancel = CancellationToken::new();
        cancel.cancel();

        svc.flush_all(true, &cancel)
            .await
            .expect("should succeed without store calls");

        let dirty = svc
            .cache()
            .get_set::<EntityKey>(OCCURRENCE_SET_KEY)
            .await
            .expect("should succeed");
        assert!(dirty.is_some(), "entity should remain dirty");
    }

    #[tokio::test]
    async fn test_entity_key_json_roundtrip() {
        let key = EntityKey::new("org1", "proj1", "ent1");
        let raw = serde_json::to_string(&key).expect("should serialize");
        let back: EntityKey = serde_json::from_str(&raw).expect("should deserialize");
        assert_eq!(back, key);
    }
}
