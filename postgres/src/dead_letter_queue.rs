//! Dead Letter Queue for outbox rows and sagas that ran out of retries.
//!
//! The relay parks an outbox row here once it exceeds its retry budget; the
//! saga orchestrator parks every saga that ends FAILED. Operators list, retry
//! and resolve entries through this type.

use chrono::{DateTime, Utc};
use seatline_core::dead_letter::{DeadLetterError, DeadLetterSink, DeadLetterSource, NewDeadLetter};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Status of an entry in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Awaiting investigation
    Pending,
    /// An operator is replaying it
    Reprocessing,
    /// Replayed successfully or fixed by hand
    Resolved,
    /// Permanently abandoned
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reprocessing => "reprocessing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "reprocessing" => Ok(Self::Reprocessing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedItem {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// Outbox or saga
    pub source: DeadLetterSource,

    /// Outbox row id or saga id
    pub reference_id: String,

    /// Event type or failing step name
    pub subject: String,

    /// Original payload or saga context
    pub payload: serde_json::Value,

    /// Last error message
    pub error_message: String,

    /// Extra diagnostic detail
    pub error_details: Option<String>,

    /// Attempts made before parking
    pub retry_count: i32,

    /// When the item was first parked
    pub first_failed_at: DateTime<Utc>,

    /// When the item last changed status
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use seatline_postgres::{DeadLetterQueue, DLQStatus};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(first) = pending.first() {
///     dlq.update_status(first.id, DLQStatus::Reprocessing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park an item. Returns the id of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the insert fails.
    pub async fn add_entry(&self, letter: &NewDeadLetter) -> Result<i64, DeadLetterError> {
        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_items (
                source, reference_id, subject, payload, error_message, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(letter.source.as_str())
        .bind(&letter.reference_id)
        .bind(&letter.subject)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.retry_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        tracing::warn!(
            dlq_id = id.0,
            source = letter.source.as_str(),
            reference_id = %letter.reference_id,
            subject = %letter.subject,
            error = %letter.error,
            retry_count = letter.retry_count,
            "Item added to Dead Letter Queue"
        );

        metrics::counter!("dlq.added", "source" => letter.source.as_str()).increment(1);

        Ok(id.0)
    }

    /// List pending items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedItem>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List items by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedItem>, DeadLetterError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, source, reference_id, subject, payload, error_message,
                error_details, retry_count, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_items
            WHERE status = $1
            ORDER BY first_failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_item).collect()
    }

    /// Get one item by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the query fails or the entry is missing.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedItem, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT
                id, source, reference_id, subject, payload, error_message,
                error_details, retry_count, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_items
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        Self::row_to_failed_item(&row)
    }

    /// Update the status of an item.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_items
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an item resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_items
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("dlq.resolved").increment(1);

        Ok(())
    }

    /// Mark an item discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_items
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("dlq.discarded").increment(1);

        Ok(())
    }

    /// Count of pending items, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM failed_items
            WHERE status = 'pending'
            ",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_item(row: &sqlx::postgres::PgRow) -> Result<FailedItem, DeadLetterError> {
        let source_str: String = row.get("source");
        let source = DeadLetterSource::parse(&source_str)
            .ok_or_else(|| DeadLetterError(format!("Invalid DLQ source: {source_str}")))?;
        let status_str: String = row.get("status");
        let status = DLQStatus::parse(&status_str)?;

        Ok(FailedItem {
            id: row.get("id"),
            source,
            reference_id: row.get("reference_id"),
            subject: row.get("subject"),
            payload: row.get("payload"),
            error_message: row.get("error_message"),
            error_details: row.get("error_details"),
            retry_count: row.get("retry_count"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record<'a>(
        &'a self,
        letter: &'a NewDeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + 'a>> {
        Box::pin(self.add_entry(letter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_matches_as_str() {
        for status in [
            DLQStatus::Pending,
            DLQStatus::Reprocessing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            assert_eq!(DLQStatus::parse(status.as_str()), Ok(status));
        }
        assert!(DLQStatus::parse("processing").is_err());
    }
}
