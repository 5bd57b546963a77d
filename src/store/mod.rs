//! Durable event store client.
//!
//! The flush driver forwards aggregated counters to the store's
//! counter-increment API. The operation must tolerate being applied more
//! than once for overlapping windows; the aggregator only promises
//! at-least-once delivery.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::StoreConfig;
use crate::usage::EntityKey;

/// Counter-increment API consumed by the flush driver.
pub trait EventStore: Send + Sync {
    /// Apply an aggregated occurrence window to the durable store.
    fn increment_event_counter(
        &self,
        key: &EntityKey,
        min_occurrence_time: DateTime<Utc>,
        max_occurrence_time: DateTime<Utc>,
        count: i64,
        send_notifications: bool,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// HTTP-based [`EventStore`] posting JSON increments to a single endpoint.
pub struct HttpEventStore {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct IncrementRequest<'a> {
    organization_id: &'a str,
    project_id: &'a str,
    entity_id: &'a str,
    min_occurrence_time: DateTime<Utc>,
    max_occurrence_time: DateTime<Utc>,
    count: i64,
    send_notifications: bool,
}

impl HttpEventStore {
    /// Create a new store client from configuration.
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
        })
    }
}

impl EventStore for HttpEventStore {
    async fn increment_event_counter(
        &self,
        key: &EntityKey,
        min_occurrence_time: DateTime<Utc>,
        max_occurrence_time: DateTime<Utc>,
        count: i64,
        send_notifications: bool,
    ) -> Result<()> {
        let body = IncrementRequest {
            organization_id: &key.organization_id,
            project_id: &key.project_id,
            entity_id: &key.entity_id,
            min_occurrence_time,
            max_occurrence_time,
            count,
            send_notifications,
        };

        debug!(
            organization = %key.organization_id,
            project = %key.project_id,
            entity = %key.entity_id,
            count,
            "posting counter increment"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("posting increment to {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {}: {body}", self.endpoint);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_request_body_shape() {
        let key = EntityKey::new("org1", "proj1", "ent1");
        let min = "2024-03-01T00:00:00Z"
            .parse::<DateTime<Utc>>()
            .expect("should parse");
        let max = "2024-03-01T01:00:00Z"
            .parse::<DateTime<Utc>>()
            .expect("should parse");

        let body = IncrementRequest {
            organization_id: &key.organization_id,
            project_id: &key.project_id,
            entity_id: &key.entity_id,
            min_occurrence_time: min,
            max_occurrence_time: max,
            count: 8,
            send_notifications: true,
        };

        let value = serde_json::to_value(&body).expect("should serialize");
        assert_eq!(value["organization_id"], "org1");
        assert_eq!(value["project_id"], "proj1");
        assert_eq!(value["entity_id"], "ent1");
        assert_eq!(value["count"], 8);
        assert_eq!(value["send_notifications"], true);
        assert!(value["min_occurrence_time"]
            .as_str()
            .expect("should be a string")
            .starts_with("2024-03-01T00:00:00"));
    }
}
