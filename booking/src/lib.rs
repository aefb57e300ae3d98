//! Seatline booking service: seat inventory and order sagas for intercity
//! bus and rail operators.
//!
//! A seat is sold per *segment*: the stretch between two consecutive
//! stations of a trip. A passenger riding A → C occupies segments A→B and
//! B→C, so the same seat can be sold again for C → D. Every piece of the
//! service is built around keeping that invariant under concurrent load:
//!
//! - **Inventory**: holds, confirmations, cancellations and blocks are one
//!   transactional write per operation against the segment rows, fronted by
//!   short-lived Redis pre-locks that shed contention before it reaches
//!   Postgres.
//! - **Orders**: an order is driven by a saga (verify identity → hold
//!   seats → charge → confirm → notify) with compensation in reverse order.
//! - **Events**: status changes and notification requests are written to a
//!   transactional outbox and relayed to Redpanda.
//! - **Live updates**: every node consumes the inventory topic on its own
//!   consumer group and fans updates out to server-sent-event subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────────┐
//! │  HTTP api  │──►│ OrderService │──►│ SagaOrchestrator  │
//! └────────────┘   └──────────────┘   └───────────────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────────┐   ┌──────────┐   ┌──────────────────┐
//! │ InventoryEngine  │◄──│ adapters │◄──│ SagaCapabilities │
//! └──────────────────┘   └──────────┘   └──────────────────┘
//!   │             │
//!   ▼             ▼
//! Postgres      Redis (pre-locks, tallies, seat-map cache)
//! ```
//!
//! # Usage
//!
//! See [`app::SeatlineApp`] for the wiring and [`server::build_router`] for
//! the HTTP surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod consumers;
pub mod entitlement;
pub mod fanout;
pub mod identity;
pub mod inventory;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod saga;
pub mod server;

pub use app::{SeatlineApp, StartupError};
pub use config::Config;
pub use inventory::{InventoryEngine, InventoryError};
pub use orders::{OrderError, OrderService};
