//! Periodic flush job.
//!
//! Drives [`OccurrenceService::flush_all`] on a fixed interval after a
//! short initial delay. Per-pass errors are logged and the loop keeps
//! going; the dirty set and count cells survive a failed pass, so the next
//! tick retries naturally.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::CacheClient;
use crate::config::FlushConfig;
use crate::export::health::HealthMetrics;
use crate::store::EventStore;
use crate::usage::OccurrenceService;

/// Interval runner for the flush driver.
pub struct FlushJob<C, S> {
    service: Arc<OccurrenceService<C, S>>,
    cfg: FlushConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl<C, S> FlushJob<C, S>
where
    C: CacheClient,
    S: EventStore,
{
    /// Create a new job over a shared service.
    pub fn new(service: Arc<OccurrenceService<C, S>>, cfg: FlushConfig) -> Self {
        Self {
            service,
            cfg,
            health: None,
        }
    }

    /// Attach health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until cancelled. On cancellation a final flush pass runs so
    /// shutdown does not strand recently recorded usage; the final pass
    /// itself observes the cancellation only between entities.
    pub async fn run(&self, ctx: CancellationToken) {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(self.cfg.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            initial_delay = ?self.cfg.initial_delay,
            interval = ?self.cfg.interval,
            send_notifications = self.cfg.send_notifications,
            "flush job started"
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    // The final pass runs against a fresh, uncancelled token
                    // so it drains everything currently dirty.
                    self.flush_once(&CancellationToken::new()).await;
                    info!("flush job stopped");
                    return;
                }

                _ = ticker.tick() => {
                    self.flush_once(&ctx).await;
                }
            }
        }
    }

    async fn flush_once(&self, cancel: &CancellationToken) {
        let start = Instant::now();

        let result = self
            .service
            .flush_all(self.cfg.send_notifications, cancel)
            .await;

        if let Some(health) = &self.health {
            health.flush_passes.inc();
            health.flush_duration.observe(start.elapsed().as_secs_f64());
        }

        if let Err(e) = result {
            if let Some(health) = &self.health {
                health.flush_errors.inc();
            }
            error!(error = %e, "flush pass failed");
        }
    }
}
