//! `PostgreSQL` saga instance store.

use seatline_core::saga::{SagaRecord, SagaStatus, SagaStore, SagaStoreError, SagaStoreFuture, StepRecord};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// [`SagaStore`] over the `saga_instances` table. Saves are upserts keyed on the
/// saga id, so every persisted transition overwrites the previous one.
#[derive(Clone)]
pub struct PgSagaStore {
    pool: PgPool,
}

impl PgSagaStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<SagaRecord, SagaStoreError> {
        let saga_id: Uuid = row.get("saga_id");
        let corrupt = |reason: String| SagaStoreError::Corrupt { saga_id, reason };

        let status_str: String = row.get("status");
        let status = SagaStatus::parse(&status_str)
            .ok_or_else(|| corrupt(format!("unknown status '{status_str}'")))?;
        let current_step: i32 = row.get("current_step");
        let current_step = usize::try_from(current_step)
            .map_err(|_| corrupt(format!("negative current_step {current_step}")))?;
        let Json(steps): Json<Vec<StepRecord>> = row
            .try_get("steps")
            .map_err(|e| corrupt(format!("steps: {e}")))?;
        let Json(context): Json<serde_json::Map<String, serde_json::Value>> = row
            .try_get("context")
            .map_err(|e| corrupt(format!("context: {e}")))?;

        Ok(SagaRecord {
            saga_id,
            name: row.get("name"),
            status,
            current_step,
            steps,
            context,
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            failure_reason: row.get("failure_reason"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl SagaStore for PgSagaStore {
    fn save<'a>(&'a self, record: &'a SagaRecord) -> SagaStoreFuture<'a, ()> {
        Box::pin(async move {
            let current_step = i32::try_from(record.current_step).map_err(|_| {
                SagaStoreError::Corrupt {
                    saga_id: record.saga_id,
                    reason: format!("current_step {} out of range", record.current_step),
                }
            })?;

            sqlx::query(
                r"
                INSERT INTO saga_instances (
                    saga_id, name, status, current_step, steps, context,
                    started_at, completed_at, failure_reason, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (saga_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    current_step = EXCLUDED.current_step,
                    steps = EXCLUDED.steps,
                    context = EXCLUDED.context,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at,
                    failure_reason = EXCLUDED.failure_reason,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(record.saga_id)
            .bind(&record.name)
            .bind(record.status.as_str())
            .bind(current_step)
            .bind(Json(&record.steps))
            .bind(Json(&record.context))
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(&record.failure_reason)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Database(e.to_string()))?;

            tracing::trace!(
                saga_id = %record.saga_id,
                status = record.status.as_str(),
                current_step = record.current_step,
                "Saga persisted"
            );
            Ok(())
        })
    }

    fn load(&self, saga_id: Uuid) -> SagaStoreFuture<'_, Option<SagaRecord>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT saga_id, name, status, current_step, steps, context,
                       started_at, completed_at, failure_reason, created_at, updated_at
                FROM saga_instances
                WHERE saga_id = $1
                ",
            )
            .bind(saga_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Database(e.to_string()))?;

            row.as_ref().map(Self::row_to_record).transpose()
        })
    }

    fn list_by_status<'a>(
        &'a self,
        statuses: &'a [SagaStatus],
    ) -> SagaStoreFuture<'a, Vec<SagaRecord>> {
        Box::pin(async move {
            let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            let rows = sqlx::query(
                r"
                SELECT saga_id, name, status, current_step, steps, context,
                       started_at, completed_at, failure_reason, created_at, updated_at
                FROM saga_instances
                WHERE status = ANY($1)
                ORDER BY created_at ASC
                ",
            )
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SagaStoreError::Database(e.to_string()))?;

            rows.iter().map(Self::row_to_record).collect()
        })
    }
}
