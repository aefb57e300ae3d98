//! Background expiry of unpaid orders.

use super::OrderService;
use std::time::Duration;
use tokio::sync::watch;

/// Periodically expires `pending` orders past their payment window.
pub struct OrderSweeper {
    orders: OrderService,
    interval: Duration,
    batch: usize,
}

impl OrderSweeper {
    /// Expire up to `batch` orders every `interval`.
    #[must_use]
    pub const fn new(orders: OrderService, interval: Duration, batch: usize) -> Self {
        Self {
            orders,
            interval,
            batch,
        }
    }

    /// Sweep until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            batch = self.batch,
            "Order sweeper started"
        );

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.orders.expire_orders(self.batch).await {
                        tracing::error!(error = %e, "Order sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Order sweeper stopped");
    }
}
