//! `PostgreSQL` stores for Seatline.
//!
//! Every relational concern of the booking core lives here, in one database:
//!
//! - [`PgInventoryStore`]: authoritative seat-segment rows with per-row CAS
//! - [`PgOutboxStore`]: the transactional outbox read by the relay
//! - [`PgOrderRepository`]: orders, written together with their outbox rows
//! - [`PgSagaStore`]: persisted saga instances
//! - [`DeadLetterQueue`]: failed outbox rows and sagas awaiting an operator
//!
//! # Example
//!
//! ```ignore
//! use seatline_postgres::{connect, migrate, PgOutboxStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/seatline", 10).await?;
//!     migrate(&pool).await?;
//!     let outbox = PgOutboxStore::new(pool.clone());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod inventory;
mod orders;
mod outbox;
mod saga_store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedItem};
pub use inventory::PgInventoryStore;
pub use orders::PgOrderRepository;
pub use outbox::{PgOutboxStore, insert_outbox_entry};
pub use saga_store::PgSagaStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
