//! Prometheus metrics for the booking core.
//!
//! Components record through the small recorder types below; the server
//! installs the Prometheus exporter once and renders it on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use seatline_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//! let body = exporter.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder installed into the global `metrics` facade.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register descriptions and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (e.g. by another test) is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "seatline_inventory_holds_total",
        "HoldSeats outcomes by result"
    );
    describe_histogram!(
        "seatline_inventory_hold_duration_seconds",
        "Time taken to grant or refuse a hold"
    );
    describe_counter!(
        "seatline_outbox_published_total",
        "Outbox entries delivered to the log"
    );
    describe_counter!(
        "seatline_outbox_failures_total",
        "Failed outbox publish attempts"
    );
    describe_counter!(
        "seatline_outbox_dead_lettered_total",
        "Outbox entries moved to the dead-letter queue"
    );
    describe_counter!(
        "seatline_saga_terminal_total",
        "Sagas reaching a terminal status"
    );
    describe_counter!(
        "seatline_fanout_dropped_total",
        "Live updates dropped because a client buffer was full"
    );
    describe_counter!("seatline_cache_hits_total", "Cache hits by level");
    describe_counter!("seatline_cache_misses_total", "Cache misses");
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!(
        "retry_exhausted_total",
        "Operations that failed after the last attempt"
    );
}

/// Inventory engine metrics.
pub struct InventoryMetrics;

impl InventoryMetrics {
    /// Record a HoldSeats outcome (`granted`, `conflict`, `rejected`, `error`).
    pub fn record_hold(result: &'static str, duration: Duration) {
        counter!("seatline_inventory_holds_total", "result" => result).increment(1);
        histogram!("seatline_inventory_hold_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Outbox relay metrics.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a delivered entry.
    pub fn record_published(topic: &str) {
        counter!("seatline_outbox_published_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed publish attempt.
    pub fn record_failure(topic: &str) {
        counter!("seatline_outbox_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an entry parked in the dead-letter queue.
    pub fn record_dead_lettered() {
        counter!("seatline_outbox_dead_lettered_total").increment(1);
    }
}

/// Saga orchestrator metrics.
pub struct SagaMetrics;

impl SagaMetrics {
    /// Record a saga reaching a terminal status.
    pub fn record_terminal(saga: &str, status: &'static str) {
        counter!(
            "seatline_saga_terminal_total",
            "saga" => saga.to_string(),
            "status" => status
        )
        .increment(1);
    }
}

/// Live update fan-out metrics.
pub struct FanoutMetrics;

impl FanoutMetrics {
    /// Record a message dropped for a slow subscriber.
    pub fn record_dropped() {
        counter!("seatline_fanout_dropped_total").increment(1);
    }
}

/// Two-level cache metrics.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a hit at `level` (`l1` or `l2`).
    pub fn record_hit(level: &'static str) {
        counter!("seatline_cache_hits_total", "level" => level).increment(1);
    }

    /// Record a miss at both levels.
    pub fn record_miss() {
        counter!("seatline_cache_misses_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_starts_uninstalled() {
        let exporter = MetricsExporter::new();
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn test_exporter_renders_recorded_metrics() {
        let mut exporter = MetricsExporter::new();
        exporter.install().unwrap();

        OutboxMetrics::record_published("travio.orders");
        InventoryMetrics::record_hold("granted", Duration::from_millis(3));

        // Another test may have installed the global recorder first.
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("seatline_outbox_published_total"));
            assert!(rendered.contains("seatline_inventory_holds_total"));
        }
    }
}
