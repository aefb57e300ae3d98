//! Background reaping of lapsed holds.

use super::InventoryEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Periodically expires holds whose TTL has passed.
///
/// Expired holds are also reaped lazily when touched and are claimable by
/// new holds as soon as they lapse, so the sweeper only bounds how long a
/// lapsed hold keeps its rows marked HELD.
pub struct HoldSweeper {
    engine: Arc<InventoryEngine>,
    interval: Duration,
    batch: usize,
}

impl HoldSweeper {
    /// Sweep up to `batch` holds every `interval`.
    #[must_use]
    pub fn new(engine: Arc<InventoryEngine>, interval: Duration, batch: usize) -> Self {
        Self {
            engine,
            interval,
            batch,
        }
    }

    /// Sweep until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            batch = self.batch,
            "Hold sweeper started"
        );

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.engine.sweep_expired(self.batch).await {
                        tracing::error!(error = %e, "Hold sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Hold sweeper stopped");
    }
}
