//! # Seatline Runtime
//!
//! Execution machinery shared by the booking services.
//!
//! ## Core Components
//!
//! - **Saga orchestrator** ([`saga`]): ordered steps, reverse-order compensation,
//!   per-transition persistence and crash recovery
//! - **Outbox relay** ([`relay`]): at-least-once delivery of committed outbox
//!   entries onto the event bus, with dead-lettering
//! - **Retry** ([`retry`]): bounded exponential backoff for transient failures
//! - **Metrics** ([`metrics`]): Prometheus exporter and per-component recorders
//!
//! ## Example
//!
//! ```ignore
//! use seatline_runtime::saga::{SagaDefinition, SagaOrchestrator, StepDefinition};
//!
//! orchestrator.register(
//!     SagaDefinition::new("booking")
//!         .step(StepDefinition::new("hold_seats", hold).with_compensation(release)),
//! );
//! let saga_id = orchestrator.create("booking", context).await?;
//! let record = orchestrator.execute(saga_id, deadline).await?;
//! ```

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox relay
pub mod relay;

/// Retry logic with exponential backoff
pub mod retry;

/// Saga orchestration
pub mod saga;

pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use retry::RetryPolicy;
pub use saga::{
    SagaContext, SagaDefinition, SagaError, SagaEvent, SagaEventKind, SagaOrchestrator,
    SagaOrchestratorConfig, StepDefinition, StepError,
};
