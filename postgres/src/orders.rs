//! `PostgreSQL` order repository.
//!
//! Every write commits the order row and its outbox entry in one transaction,
//! so a committed order change always has an event waiting for the relay.

use crate::outbox::insert_outbox_entry;
use seatline_core::order::{
    BookedSeat, InsertOutcome, Order, OrderFuture, OrderPassenger, OrderRepository, OrderStatus,
    OrderStoreError, PaymentStatus,
};
use chrono::{DateTime, Utc};
use seatline_core::outbox::OutboxEntry;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const ORDER_COLUMNS: &str = r"
    id, organization_id, user_id, trip_id, from_station_id, to_station_id,
    passengers, subtotal_paisa, tax_paisa, booking_fee_paisa, discount_paisa,
    total_paisa, currency, payment_id, payment_status, payment_method,
    booking_id, hold_id, seats, status, saga_id, contact_email, contact_phone,
    created_at, updated_at, expires_at, idempotency_key
";

/// [`OrderRepository`] over the `orders` and `event_outbox` tables.
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    /// Create a repository over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db(e: sqlx::Error) -> OrderStoreError {
        OrderStoreError::Database(e.to_string())
    }

    fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<Order, OrderStoreError> {
        let order_id: Uuid = row.get("id");
        let corrupt = |reason: String| OrderStoreError::Corrupt { order_id, reason };

        let status_str: String = row.get("status");
        let status = OrderStatus::parse(&status_str)
            .ok_or_else(|| corrupt(format!("unknown status '{status_str}'")))?;
        let payment_str: String = row.get("payment_status");
        let payment_status = PaymentStatus::parse(&payment_str)
            .ok_or_else(|| corrupt(format!("unknown payment status '{payment_str}'")))?;
        let Json(passengers): Json<Vec<OrderPassenger>> = row
            .try_get("passengers")
            .map_err(|e| corrupt(format!("passengers: {e}")))?;
        let Json(seats): Json<Vec<BookedSeat>> = row
            .try_get("seats")
            .map_err(|e| corrupt(format!("seats: {e}")))?;

        Ok(Order {
            id: order_id,
            organization_id: row.get("organization_id"),
            user_id: row.get("user_id"),
            trip_id: row.get("trip_id"),
            from_station_id: row.get("from_station_id"),
            to_station_id: row.get("to_station_id"),
            passengers,
            subtotal_paisa: row.get("subtotal_paisa"),
            tax_paisa: row.get("tax_paisa"),
            booking_fee_paisa: row.get("booking_fee_paisa"),
            discount_paisa: row.get("discount_paisa"),
            total_paisa: row.get("total_paisa"),
            currency: row.get("currency"),
            payment_id: row.get("payment_id"),
            payment_status,
            payment_method: row.get("payment_method"),
            booking_id: row.get("booking_id"),
            hold_id: row.get("hold_id"),
            seats,
            status,
            saga_id: row.get("saga_id"),
            contact_email: row.get("contact_email"),
            contact_phone: row.get("contact_phone"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            expires_at: row.get("expires_at"),
            idempotency_key: row.get("idempotency_key"),
        })
    }

    async fn fetch_by_key(
        &self,
        organization_id: &str,
        key: &str,
    ) -> Result<Option<Order>, OrderStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE organization_id = $1 AND idempotency_key = $2"
        ))
        .bind(organization_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db)?;

        row.as_ref().map(Self::row_to_order).transpose()
    }
}

impl OrderRepository for PgOrderRepository {
    fn insert<'a>(
        &'a self,
        order: &'a Order,
        event: &'a OutboxEntry,
    ) -> OrderFuture<'a, InsertOutcome> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(Self::db)?;

            let result = sqlx::query(
                r"
                INSERT INTO orders (
                    id, organization_id, user_id, trip_id, from_station_id, to_station_id,
                    passengers, subtotal_paisa, tax_paisa, booking_fee_paisa, discount_paisa,
                    total_paisa, currency, payment_id, payment_status, payment_method,
                    booking_id, hold_id, seats, status, saga_id, contact_email, contact_phone,
                    created_at, updated_at, expires_at, idempotency_key
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
                )
                ON CONFLICT (organization_id, idempotency_key)
                    WHERE idempotency_key IS NOT NULL
                    DO NOTHING
                ",
            )
            .bind(order.id)
            .bind(&order.organization_id)
            .bind(&order.user_id)
            .bind(&order.trip_id)
            .bind(&order.from_station_id)
            .bind(&order.to_station_id)
            .bind(Json(&order.passengers))
            .bind(order.subtotal_paisa)
            .bind(order.tax_paisa)
            .bind(order.booking_fee_paisa)
            .bind(order.discount_paisa)
            .bind(order.total_paisa)
            .bind(&order.currency)
            .bind(&order.payment_id)
            .bind(order.payment_status.as_str())
            .bind(&order.payment_method)
            .bind(order.booking_id)
            .bind(order.hold_id)
            .bind(Json(&order.seats))
            .bind(order.status.as_str())
            .bind(order.saga_id)
            .bind(&order.contact_email)
            .bind(&order.contact_phone)
            .bind(order.created_at)
            .bind(order.updated_at)
            .bind(order.expires_at)
            .bind(&order.idempotency_key)
            .execute(&mut *tx)
            .await
            .map_err(Self::db)?;

            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(Self::db)?;
                let key = order.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .fetch_by_key(&order.organization_id, key)
                    .await?
                    .ok_or_else(|| OrderStoreError::Database(format!(
                        "idempotency conflict on '{key}' but no order found"
                    )))?;
                tracing::info!(
                    order_id = %existing.id,
                    idempotency_key = key,
                    "Duplicate order insert resolved to existing order"
                );
                return Ok(InsertOutcome::Duplicate(Box::new(existing)));
            }

            insert_outbox_entry(&mut tx, event).await.map_err(Self::db)?;
            tx.commit().await.map_err(Self::db)?;

            metrics::counter!("orders.created").increment(1);
            Ok(InsertOutcome::Inserted)
        })
    }

    fn update<'a>(
        &'a self,
        order: &'a Order,
        event: Option<&'a OutboxEntry>,
    ) -> OrderFuture<'a, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(Self::db)?;

            let result = sqlx::query(
                r"
                UPDATE orders SET
                    passengers = $2,
                    payment_id = $3,
                    payment_status = $4,
                    booking_id = $5,
                    hold_id = $6,
                    seats = $7,
                    status = $8,
                    saga_id = $9,
                    updated_at = $10
                WHERE id = $1
                ",
            )
            .bind(order.id)
            .bind(Json(&order.passengers))
            .bind(&order.payment_id)
            .bind(order.payment_status.as_str())
            .bind(order.booking_id)
            .bind(order.hold_id)
            .bind(Json(&order.seats))
            .bind(order.status.as_str())
            .bind(order.saga_id)
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(Self::db)?;

            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(Self::db)?;
                return Err(OrderStoreError::Database(format!(
                    "order {} does not exist",
                    order.id
                )));
            }

            if let Some(event) = event {
                insert_outbox_entry(&mut tx, event).await.map_err(Self::db)?;
            }
            tx.commit().await.map_err(Self::db)?;
            Ok(())
        })
    }

    fn get(&self, order_id: Uuid) -> OrderFuture<'_, Option<Order>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::db)?;

            row.as_ref().map(Self::row_to_order).transpose()
        })
    }

    fn find_by_idempotency_key<'a>(
        &'a self,
        organization_id: &'a str,
        key: &'a str,
    ) -> OrderFuture<'a, Option<Order>> {
        Box::pin(self.fetch_by_key(organization_id, key))
    }

    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> OrderFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {ORDER_COLUMNS} FROM orders
                WHERE status = 'pending' AND expires_at <= $1
                ORDER BY expires_at
                LIMIT $2
                "
            ))
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::db)?;

            rows.iter().map(Self::row_to_order).collect()
        })
    }

    fn list_for_user<'a>(
        &'a self,
        organization_id: &'a str,
        user_id: &'a str,
        limit: usize,
        offset: usize,
    ) -> OrderFuture<'a, Vec<Order>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {ORDER_COLUMNS} FROM orders
                WHERE organization_id = $1 AND user_id = $2
                ORDER BY created_at DESC, id DESC
                LIMIT $3 OFFSET $4
                "
            ))
            .bind(organization_id)
            .bind(user_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::db)?;

            rows.iter().map(Self::row_to_order).collect()
        })
    }
}
