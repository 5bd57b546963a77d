use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "tally" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total occurrences folded into the cache (sum of record deltas).
    pub occurrences_recorded: Counter,
    /// Total entities successfully flushed to the durable store.
    pub entities_flushed: Counter,
    /// Total flush passes, successful or not.
    pub flush_passes: Counter,
    /// Total flush passes that ended in an error.
    pub flush_errors: Counter,
    /// Total cache operation failures while recording occurrences.
    pub cache_errors: Counter,
    /// Flush pass duration in seconds.
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let occurrences_recorded = Counter::with_opts(
            Opts::new(
                "occurrences_recorded_total",
                "Total occurrences folded into the cache.",
            )
            .namespace("tally"),
        )?;
        let entities_flushed = Counter::with_opts(
            Opts::new(
                "entities_flushed_total",
                "Total entities successfully flushed to the durable store.",
            )
            .namespace("tally"),
        )?;
        let flush_passes = Counter::with_opts(
            Opts::new("flush_passes_total", "Total flush passes started.").namespace("tally"),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new(
                "flush_errors_total",
                "Total flush passes that ended in an error.",
            )
            .namespace("tally"),
        )?;
        let cache_errors = Counter::with_opts(
            Opts::new(
                "cache_errors_total",
                "Total cache operation failures while recording occurrences.",
            )
            .namespace("tally"),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Flush pass duration in seconds.")
                .namespace("tally")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(occurrences_recorded.clone()))?;
        registry.register(Box::new(entities_flushed.clone()))?;
        registry.register(Box::new(flush_passes.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(cache_errors.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            occurrences_recorded,
            entities_flushed,
            flush_passes,
            flush_errors,
            cache_errors,
            flush_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("should build metrics");

        health.occurrences_recorded.inc_by(5.0);
        health.entities_flushed.inc();
        health.flush_passes.inc();

        let text = TextEncoder::new()
            .encode_to_string(&health.registry.gather())
            .expect("should encode");
        assert!(text.contains("tally_occurrences_recorded_total 5"));
        assert!(text.contains("tally_entities_flushed_total 1"));
        assert!(text.contains("tally_flush_duration_seconds"));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_noop() {
        let health = HealthMetrics::new(":0").expect("should build metrics");
        health.stop().await.expect("should succeed");
    }
}
