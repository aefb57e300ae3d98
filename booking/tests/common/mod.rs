//! In-process service stack over the in-memory fakes.
//!
//! Every component is the production one; only storage, cache, bus and the
//! subscription service are replaced.

#![allow(dead_code)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use seatline_booking::adapters::{
    EngineInventory, IdentityVerifier, OutboxNotifications, RegistryPayments,
};
use seatline_booking::cache::{CacheConfig, MultiLevelCache};
use seatline_booking::entitlement::{
    EntitlementChecker, EntitlementConfig, EntitlementFetcher, Entitlements, FetchFuture,
};
use seatline_booking::fanout::FanoutManager;
use seatline_booking::identity::SandboxIdentityProvider;
use seatline_booking::inventory::{
    HoldRequest, InventoryConfig, InventoryEngine, SeatEventPublisher,
};
use seatline_booking::notifications::OutboxNotifier;
use seatline_booking::orders::{CreateOrderRequest, OrderService, OrderServiceConfig};
use seatline_booking::payments::{PaymentRegistry, SandboxProvider};
use seatline_booking::saga::{SagaCapabilities, booking_saga, cancellation_saga};
use seatline_booking::server::{AppState, build_router};
use seatline_core::cache::SharedCache;
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::inventory::{SeatClass, SeatSpec, SeatType, TripManifest};
use seatline_core::order::OrderPassenger;
use seatline_runtime::metrics::MetricsExporter;
use seatline_runtime::retry::RetryPolicy;
use seatline_runtime::saga::{SagaOrchestrator, SagaOrchestratorConfig};
use seatline_testing::{
    InMemoryCache, InMemoryEventBus, InMemoryInventoryStore, InMemoryOrders, InMemoryOutbox,
    InMemorySagaStore, MockClock,
};
use seatline_web::handlers::ReadinessProbe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const ORG: &str = "org-1";
pub const TRIP: &str = "T1";

/// Subscription service stand-in serving one mutable record.
pub struct FixedEntitlements {
    record: Mutex<Option<Entitlements>>,
}

impl FixedEntitlements {
    pub fn set(&self, record: Option<Entitlements>) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }
}

impl EntitlementFetcher for FixedEntitlements {
    fn fetch<'a>(&'a self, _organization_id: &'a str) -> FetchFuture<'a> {
        let record = self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::pin(async move { Ok(record) })
    }
}

pub struct Stack {
    pub clock: MockClock,
    pub store: InMemoryInventoryStore,
    pub cache: Arc<InMemoryCache>,
    pub bus: Arc<InMemoryEventBus>,
    pub outbox: Arc<InMemoryOutbox>,
    pub orders_store: Arc<InMemoryOrders>,
    pub engine: Arc<InventoryEngine>,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub orders: OrderService,
    pub entitlements: Arc<EntitlementChecker>,
    pub subscription: Arc<FixedEntitlements>,
    /// The provider behind `card`, `bank` and `mobile_bank` payments.
    pub sslcommerz: Arc<SandboxProvider>,
    pub fanout: Arc<FanoutManager>,
}

impl Stack {
    pub fn new() -> Self {
        seatline_testing::init_tracing();
        let clock = MockClock::at_test_epoch();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = InMemoryInventoryStore::new();
        let cache = Arc::new(InMemoryCache::with_clock(Arc::clone(&shared_clock)));
        let bus = Arc::new(InMemoryEventBus::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let orders_store = Arc::new(InMemoryOrders::new(Arc::clone(&outbox)));

        let multi = Arc::new(MultiLevelCache::new(
            cache.clone(),
            Arc::clone(&shared_clock),
            CacheConfig::default(),
        ));
        let engine = Arc::new(
            InventoryEngine::new(
                Arc::new(store.clone()),
                Arc::clone(&multi),
                Arc::clone(&shared_clock),
                InventoryConfig {
                    store_retry: RetryPolicy::builder()
                        .max_attempts(3)
                        .initial_delay(Duration::from_millis(1))
                        .build(),
                    ..InventoryConfig::default()
                },
            )
            .with_events(SeatEventPublisher::new(bus.clone())),
        );

        let subscription = Arc::new(FixedEntitlements {
            record: Mutex::new(Some(Entitlements::permissive(ORG, shared_clock.now()))),
        });
        let entitlements = Arc::new(EntitlementChecker::new(
            subscription.clone(),
            Arc::clone(&multi),
            Arc::clone(&shared_clock),
            EntitlementConfig {
                enabled: true,
                fail_open: false,
                cache_ttl: Duration::from_secs(300),
            },
        ));

        let registry = PaymentRegistry::with_defaults("sslcommerz", true).expect("registry");
        let sslcommerz = Arc::new(SandboxProvider::new("sslcommerz", Arc::clone(&shared_clock)));
        registry.install(sslcommerz.clone());

        let capabilities = SagaCapabilities {
            identity: Arc::new(IdentityVerifier::new(Arc::new(SandboxIdentityProvider::new(
                Arc::clone(&shared_clock),
            )))),
            inventory: Arc::new(EngineInventory::new(Arc::clone(&engine))),
            payments: Arc::new(RegistryPayments::new(Arc::new(registry))),
            notifications: Arc::new(OutboxNotifications::new(
                OutboxNotifier::new(outbox.clone()),
                Arc::clone(&shared_clock),
            )),
        };
        let orchestrator = Arc::new(SagaOrchestrator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::clone(&shared_clock),
            SagaOrchestratorConfig::default(),
        ));
        orchestrator.register(booking_saga(&capabilities));
        orchestrator.register(cancellation_saga(&capabilities));

        let orders = OrderService::new(
            orders_store.clone(),
            Arc::clone(&orchestrator),
            engine.clone(),
            Arc::clone(&shared_clock),
            OrderServiceConfig::default(),
        )
        .with_entitlements(Arc::clone(&entitlements));

        Self {
            clock,
            store,
            cache,
            bus,
            outbox,
            orders_store,
            engine,
            orchestrator,
            orders,
            entitlements,
            subscription,
            sslcommerz,
            fanout: FanoutManager::new(),
        }
    }

    /// A stack with trip `T1` over stops `A,B,C,D` and the given economy seats.
    pub async fn with_trip(seats: &[&str]) -> Self {
        let stack = Self::new();
        stack
            .engine
            .initialize_trip(&manifest(seats), Deadline::none())
            .await
            .expect("initialize trip");
        stack
    }

    /// Router over this stack; `/metrics` reports no recorder.
    pub fn router(&self) -> axum::Router {
        let cache: Arc<dyn SharedCache> = self.cache.clone();
        let state = AppState {
            inventory: Arc::clone(&self.engine),
            orders: self.orders.clone(),
            entitlements: Arc::clone(&self.entitlements),
            fanout: Arc::clone(&self.fanout),
            cache,
            probes: Vec::<Arc<dyn ReadinessProbe>>::new().into(),
            metrics: Arc::new(MetricsExporter::new()),
        };
        build_router(state, Duration::from_secs(5))
    }
}

pub fn manifest(seats: &[&str]) -> TripManifest {
    TripManifest {
        org_id: ORG.to_string(),
        trip_id: TRIP.to_string(),
        stops: vec!["A".into(), "B".into(), "C".into(), "D".into()],
        seats: seats
            .iter()
            .enumerate()
            .map(|(i, id)| SeatSpec {
                seat_id: (*id).to_string(),
                number: format!("{}A", i + 1),
                row: u32::try_from(i / 4 + 1).unwrap_or(1),
                class: SeatClass::Economy,
                seat_type: SeatType::Window,
                price_paisa: 80_000,
                blocked: false,
            })
            .collect(),
    }
}

pub fn hold_request(user: &str, from: &str, to: &str, seats: &[&str]) -> HoldRequest {
    HoldRequest {
        org_id: ORG.to_string(),
        trip_id: TRIP.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        seat_ids: seats.iter().map(ToString::to_string).collect(),
        user_id: user.to_string(),
        session_id: format!("session-{user}"),
        ttl: None,
        client_ip: None,
        identity_documents: Vec::new(),
    }
}

pub fn order_request(user: &str, from: &str, to: &str, seats: &[&str]) -> CreateOrderRequest {
    CreateOrderRequest {
        organization_id: ORG.to_string(),
        user_id: user.to_string(),
        session_id: format!("session-{user}"),
        trip_id: TRIP.to_string(),
        from_station_id: from.to_string(),
        to_station_id: to.to_string(),
        passengers: seats
            .iter()
            .enumerate()
            .map(|(i, seat)| OrderPassenger {
                nid: format!("12345678{i:02}"),
                name: "Rahim Uddin".to_string(),
                date_of_birth: "1990-01-01".to_string(),
                seat_id: (*seat).to_string(),
                gender: String::new(),
                age: 35,
                nid_verified: false,
            })
            .collect(),
        payment_method: "card".to_string(),
        contact_email: "rahim@example.com".to_string(),
        ..CreateOrderRequest::default()
    }
}

/// Let spawned pre-lock releases run before the next hold on the same rows.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
