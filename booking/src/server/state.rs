//! Application state shared by every handler.

use crate::entitlement::EntitlementChecker;
use crate::fanout::FanoutManager;
use crate::inventory::InventoryEngine;
use crate::orders::OrderService;
use seatline_core::cache::SharedCache;
use seatline_runtime::metrics::MetricsExporter;
use seatline_web::handlers::ReadinessProbe;
use std::sync::Arc;

/// Cloned per request; every field is a handle.
#[derive(Clone)]
pub struct AppState {
    /// Seat inventory.
    pub inventory: Arc<InventoryEngine>,
    /// Orders and their sagas.
    pub orders: OrderService,
    /// Entitlement gate, for operator invalidation.
    pub entitlements: Arc<EntitlementChecker>,
    /// This node's live streams.
    pub fanout: Arc<FanoutManager>,
    /// Shared cache, for idempotency keys.
    pub cache: Arc<dyn SharedCache>,
    /// Dependencies checked by `/ready`.
    pub probes: Arc<[Arc<dyn ReadinessProbe>]>,
    /// Prometheus recorder rendered by `/metrics`.
    pub metrics: Arc<MetricsExporter>,
}
