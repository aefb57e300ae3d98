//! `PostgreSQL` outbox table.

use chrono::{DateTime, Utc};
use seatline_core::outbox::{OutboxEntry, OutboxError, OutboxFuture, OutboxStore};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

/// Write `entry` on an open connection, typically inside the transaction that
/// carries the business mutation it announces.
///
/// # Errors
///
/// Returns the driver error if the insert fails.
pub async fn insert_outbox_entry(
    conn: &mut PgConnection,
    entry: &OutboxEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO event_outbox (id, aggregate_id, event_type, topic, payload, created_at, retries)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(entry.id)
    .bind(&entry.aggregate_id)
    .bind(&entry.event_type)
    .bind(&entry.topic)
    .bind(&entry.payload)
    .bind(entry.created_at)
    .bind(entry.retries)
    .execute(conn)
    .await?;
    Ok(())
}

/// [`OutboxStore`] over the `event_outbox` table.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> OutboxEntry {
        OutboxEntry {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
            processed_at: row.get("processed_at"),
            retries: row.get("retries"),
        }
    }
}

impl OutboxStore for PgOutboxStore {
    fn append<'a>(&'a self, entry: &'a OutboxEntry) -> OutboxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))?;
            insert_outbox_entry(&mut conn, entry)
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))
        })
    }

    fn pending(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query(
                r"
                SELECT id, aggregate_id, event_type, topic, payload, created_at, processed_at, retries
                FROM event_outbox
                WHERE processed_at IS NULL AND dead_lettered_at IS NULL
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                ",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_entry).collect())
        })
    }

    fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE event_outbox SET processed_at = $2 WHERE id = $1")
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))?;
            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, id: Uuid, error: &'a str) -> OutboxFuture<'a, i32> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                UPDATE event_outbox
                SET retries = retries + 1, last_error = $2
                WHERE id = $1
                RETURNING retries
                ",
            )
            .bind(id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?
            .ok_or(OutboxError::NotFound(id))?;
            Ok(row.get("retries"))
        })
    }

    fn dead_letter<'a>(&'a self, id: Uuid, reason: &'a str) -> OutboxFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE event_outbox
                SET dead_lettered_at = NOW(), last_error = $2
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn purge_processed(&self, before: DateTime<Utc>) -> OutboxFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM event_outbox WHERE processed_at IS NOT NULL AND processed_at < $1",
            )
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

            let purged = result.rows_affected();
            if purged > 0 {
                tracing::debug!(purged, "Purged delivered outbox rows");
            }
            Ok(purged)
        })
    }
}
