//! Process wiring: builds every component from [`Config`] and owns the
//! background tasks.
//!
//! ```text
//!   HTTP ──► OrderService ──► SagaOrchestrator ──► capabilities ──► InventoryEngine
//!                │                   │                                   │
//!                └──── outbox ◄──────┴─── notifications                  ├─► Postgres rows
//!                        │                                               └─► Redis pre-locks, tallies
//!                   OutboxRelay ──► Redpanda ──► catalog consumer (shared group)
//!                                       └──────► fan-out (group per node) ──► SSE
//! ```

use crate::adapters::{EngineInventory, IdentityVerifier, OutboxNotifications, RegistryPayments};
use crate::cache::{CacheConfig, MultiLevelCache};
use crate::config::Config;
use crate::consumers::{CATALOG_CONSUMER, CATALOG_CONSUMER_GROUP, CatalogConsumer, ProcessedEvents};
use crate::entitlement::{
    EntitlementChecker, EntitlementConfig, EntitlementError, HttpEntitlementFetcher,
};
use crate::fanout::{FanoutBroadcaster, FanoutManager, REALTIME_GROUP_PREFIX};
use crate::identity::SandboxIdentityProvider;
use crate::inventory::{
    HoldSweeper, InventoryConfig, InventoryEngine, SeatEventPublisher, TicketLimits,
};
use crate::notifications::OutboxNotifier;
use crate::orders::{OrderService, OrderServiceConfig, OrderSweeper};
use crate::payments::{PaymentError, PaymentRegistry};
use crate::saga::{SagaCapabilities, booking_saga, cancellation_saga};
use crate::server::{AppState, PostgresProbe, RedisProbe, build_router};
use axum::Router;
use seatline_core::cache::{CacheError, SharedCache};
use seatline_core::deadline::Deadline;
use seatline_core::environment::{Clock, SystemClock};
use seatline_core::event::topics;
use seatline_core::event_bus::{EventBus, EventBusError, EventHandler};
use seatline_core::outbox::OutboxStore;
use seatline_postgres::{
    DeadLetterQueue, PgInventoryStore, PgOrderRepository, PgOutboxStore, PgSagaStore,
};
use seatline_redis::RedisCache;
use seatline_redpanda::RedpandaEventBus;
use seatline_runtime::metrics::{MetricsError, MetricsExporter};
use seatline_runtime::relay::{OutboxRelay, RelayConfig};
use seatline_runtime::retry::RetryPolicy;
use seatline_runtime::saga::{SagaOrchestrator, SagaOrchestratorConfig};
use seatline_web::handlers::ReadinessProbe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Expired holds or orders handled per sweep.
const SWEEP_BATCH: usize = 100;
/// Bound on one subscription-service call.
const ENTITLEMENT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on startup saga recovery.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Startup failures.
#[derive(Error, Debug)]
pub enum StartupError {
    /// Postgres could not be reached.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis could not be reached.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The log producer could not be created.
    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// The subscription-service client could not be built.
    #[error("entitlement client error: {0}")]
    Entitlement(#[from] EntitlementError),

    /// A payment provider could not be configured.
    #[error("payment registry error: {0}")]
    Payments(#[from] PaymentError),

    /// The Prometheus recorder could not be installed.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// The assembled booking service.
pub struct SeatlineApp {
    config: Config,
    state: AppState,
    engine: Arc<InventoryEngine>,
    checker: Arc<EntitlementChecker>,
    shared: Arc<dyn SharedCache>,
    relay: Arc<OutboxRelay>,
}

impl SeatlineApp {
    /// Connect to every dependency and build the components.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if a dependency is unreachable or misconfigured.
    pub async fn new(config: Config) -> Result<Self, StartupError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        tracing::info!(max_connections = config.postgres.max_connections, "Connecting to Postgres");
        let pool =
            seatline_postgres::connect(&config.postgres.url, config.postgres.max_connections)
                .await?;
        seatline_postgres::migrate(&pool).await?;

        tracing::info!("Connecting to Redis");
        let redis = Arc::new(RedisCache::new(&config.redis.url).await?);
        let shared: Arc<dyn SharedCache> = redis.clone();
        let cache = Arc::new(MultiLevelCache::new(
            Arc::clone(&shared),
            Arc::clone(&clock),
            CacheConfig {
                l1_items: config.cache.l1_items,
                l1_ttl: config.cache.l1_ttl,
                l2_ttl: config.cache.l2_ttl,
            },
        ));

        tracing::info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda");
        let bus: Arc<dyn EventBus> = Arc::new(
            RedpandaEventBus::builder()
                .brokers(&config.redpanda.brokers)
                .build()?,
        );

        let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(pool.clone()));

        let engine = Arc::new(
            InventoryEngine::new(
                Arc::new(PgInventoryStore::new(pool.clone())),
                Arc::clone(&cache),
                Arc::clone(&clock),
                InventoryConfig {
                    hold_ttl: config.inventory.hold_ttl,
                    max_holds_per_user: config.inventory.max_holds_per_user,
                    prelock_ttl: config.inventory.prelock_ttl,
                    op_timeout: config.inventory.op_timeout,
                    limits: TicketLimits {
                        per_user: config.ticket_limits.per_user,
                        per_ip: config.ticket_limits.per_ip,
                        per_identity: config.ticket_limits.per_identity,
                        per_hour: config.ticket_limits.per_hour,
                    },
                    ..InventoryConfig::default()
                },
            )
            .with_events(SeatEventPublisher::new(Arc::clone(&bus))),
        );

        let checker = Arc::new(EntitlementChecker::new(
            Arc::new(HttpEntitlementFetcher::new(
                config.entitlement.subscription_service_addr.clone(),
                ENTITLEMENT_FETCH_TIMEOUT,
            )?),
            Arc::clone(&cache),
            Arc::clone(&clock),
            EntitlementConfig {
                enabled: config.entitlement.enabled,
                fail_open: config.entitlement.fail_open,
                cache_ttl: config.entitlement.cache_ttl,
            },
        ));

        let payments = Arc::new(PaymentRegistry::with_defaults(
            config.payments.fallback_provider.clone(),
            config.payments.sandbox,
        )?);
        let capabilities = SagaCapabilities {
            identity: Arc::new(IdentityVerifier::new(Arc::new(
                SandboxIdentityProvider::new(Arc::clone(&clock)),
            ))),
            inventory: Arc::new(EngineInventory::new(Arc::clone(&engine))),
            payments: Arc::new(RegistryPayments::new(payments)),
            notifications: Arc::new(OutboxNotifications::new(
                OutboxNotifier::new(Arc::clone(&outbox)),
                Arc::clone(&clock),
            )),
        };

        let orchestrator = Arc::new(
            SagaOrchestrator::new(
                Arc::new(PgSagaStore::new(pool.clone())),
                Arc::clone(&clock),
                SagaOrchestratorConfig {
                    step_timeout: config.saga.step_timeout,
                    compensation_timeout: config.saga.step_timeout,
                    persist_retry: RetryPolicy::default(),
                    ..SagaOrchestratorConfig::default()
                },
            )
            .with_dead_letter_sink(dead_letters.clone()),
        );
        orchestrator.register(booking_saga(&capabilities));
        orchestrator.register(cancellation_saga(&capabilities));

        let orders = OrderService::new(
            Arc::new(PgOrderRepository::new(pool.clone())),
            orchestrator,
            engine.clone(),
            Arc::clone(&clock),
            OrderServiceConfig::default(),
        )
        .with_entitlements(Arc::clone(&checker));

        let relay = Arc::new(
            OutboxRelay::new(
                outbox,
                bus,
                Arc::clone(&clock),
                RelayConfig {
                    poll_interval: config.outbox.poll_interval,
                    batch_size: config.outbox.batch_size,
                    max_retries: config.outbox.max_retries,
                    retention: config.outbox.retention,
                    ..RelayConfig::default()
                },
            )
            .with_dead_letter_sink(dead_letters),
        );

        let mut metrics = MetricsExporter::new();
        metrics.install()?;

        let probes: Vec<Arc<dyn ReadinessProbe>> =
            vec![Arc::new(PostgresProbe(pool)), Arc::new(RedisProbe(redis))];

        let state = AppState {
            inventory: Arc::clone(&engine),
            orders,
            entitlements: Arc::clone(&checker),
            fanout: FanoutManager::new(),
            cache: Arc::clone(&shared),
            probes: probes.into(),
            metrics: Arc::new(metrics),
        };

        tracing::info!("Components initialised");
        Ok(Self {
            config,
            state,
            engine,
            checker,
            shared,
            relay,
        })
    }

    /// The HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.config.server.request_timeout)
    }

    /// Spawn the background tasks; each stops when `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if a consumer bus cannot be created.
    pub fn start(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, EventBusError> {
        let mut tasks = Vec::new();

        let relay = Arc::clone(&self.relay);
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(
            async move { relay.run(rx).await }.instrument(tracing::info_span!("outbox_relay")),
        ));

        let sweeper = HoldSweeper::new(
            Arc::clone(&self.engine),
            self.config.inventory.sweep_interval,
            SWEEP_BATCH,
        );
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(
            async move { sweeper.run(rx).await }.instrument(tracing::info_span!("hold_sweeper")),
        ));

        let order_sweeper = OrderSweeper::new(
            self.state.orders.clone(),
            self.config.saga.order_sweep_interval,
            SWEEP_BATCH,
        );
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(
            async move { order_sweeper.run(rx).await }
                .instrument(tracing::info_span!("order_sweeper")),
        ));

        let checker = Arc::clone(&self.checker);
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(
            async move { checker.listen_for_invalidations(rx).await }
                .instrument(tracing::info_span!("entitlement_invalidations")),
        ));

        // Every node sees every inventory event.
        let realtime_bus = RedpandaEventBus::builder()
            .brokers(&self.config.redpanda.brokers)
            .unique_consumer_group(REALTIME_GROUP_PREFIX)
            .build()?;
        tasks.push(spawn_consumer(
            realtime_bus,
            topics::INVENTORY,
            Arc::new(FanoutBroadcaster::new(Arc::clone(&self.state.fanout))),
            shutdown.clone(),
        ));

        // One node initialises each trip.
        let catalog_bus = RedpandaEventBus::builder()
            .brokers(&self.config.redpanda.brokers)
            .consumer_group(CATALOG_CONSUMER_GROUP)
            .auto_offset_reset("earliest")
            .build()?;
        tasks.push(spawn_consumer(
            catalog_bus,
            topics::CATALOG,
            Arc::new(CatalogConsumer::new(
                Arc::clone(&self.engine),
                ProcessedEvents::new(Arc::clone(&self.shared), CATALOG_CONSUMER),
            )),
            shutdown.clone(),
        ));

        let orders = self.state.orders.clone();
        let auto_resume = self.config.saga.auto_resume;
        tasks.push(tokio::spawn(
            async move {
                match orders
                    .recover_sagas(auto_resume, Deadline::after(RECOVERY_TIMEOUT))
                    .await
                {
                    Ok(ids) if ids.is_empty() => tracing::debug!("No interrupted sagas"),
                    Ok(ids) => tracing::info!(count = ids.len(), auto_resume, "Interrupted sagas found"),
                    Err(e) => tracing::error!(error = %e, "Saga recovery failed"),
                }
            }
            .instrument(tracing::info_span!("saga_recovery")),
        ));

        Ok(tasks)
    }

    /// Socket address from the configuration.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }
}

fn spawn_consumer(
    bus: RedpandaEventBus,
    topic: &'static str,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("consumer", topic, group = %bus.group_id());
    tokio::spawn(
        async move {
            if let Err(e) = bus.consume(&[topic], handler, shutdown).await {
                tracing::error!(error = %e, "Consumer stopped");
            }
        }
        .instrument(span),
    )
}
