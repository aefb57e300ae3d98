//! `PostgreSQL` seat-segment inventory.
//!
//! Each `(org, trip, segment, seat)` row is updated with a single conditional
//! `UPDATE`, so the database arbitrates every race between concurrent holds.
//! Multi-row transitions that must be all-or-nothing (conversion to a booking,
//! blocking a seat) run inside one transaction and roll back on a count
//! mismatch.

use chrono::{DateTime, Utc};
use seatline_core::inventory::{
    Booking, BookingPassenger, BookingStatus, HoldClaim, HoldStatus, InventoryStore, SeatHold,
    SeatSegmentRow, SeatState, SeatTicket, SegmentRange, StoreError, StoreFuture, TripManifest,
};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const STATUS_AVAILABLE: &str = "available";
const STATUS_HELD: &str = "held";
const STATUS_BOOKED: &str = "booked";
const STATUS_BLOCKED: &str = "blocked";

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn to_db_index(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Invariant(format!("index {value} out of range")))
}

fn from_db_index(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invariant(format!("negative index {value}")))
}

/// [`InventoryStore`] backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> Result<SeatState, StoreError> {
        let status: String = row.get("status");
        match status.as_str() {
            STATUS_AVAILABLE => Ok(SeatState::Available),
            STATUS_BLOCKED => Ok(SeatState::Blocked),
            STATUS_HELD => {
                let hold_id: Option<Uuid> = row.get("hold_id");
                let user_id: Option<String> = row.get("user_id");
                let expires_at: Option<DateTime<Utc>> = row.get("hold_expires_at");
                match (hold_id, user_id, expires_at) {
                    (Some(hold_id), Some(user_id), Some(expires_at)) => Ok(SeatState::Held {
                        hold_id,
                        user_id,
                        expires_at,
                    }),
                    _ => Err(StoreError::Invariant(
                        "held row without hold_id, user_id or expiry".to_string(),
                    )),
                }
            }
            STATUS_BOOKED => {
                let booking_id: Option<Uuid> = row.get("booking_id");
                booking_id
                    .map(|booking_id| SeatState::Booked { booking_id })
                    .ok_or_else(|| StoreError::Invariant("booked row without booking_id".into()))
            }
            other => Err(StoreError::Invariant(format!("unknown seat status '{other}'"))),
        }
    }

    fn row_to_hold(row: &sqlx::postgres::PgRow) -> Result<SeatHold, StoreError> {
        let status: String = row.get("status");
        let status = HoldStatus::parse(&status)
            .ok_or_else(|| StoreError::Invariant(format!("unknown hold status '{status}'")))?;
        Ok(SeatHold {
            hold_id: row.get("hold_id"),
            org_id: row.get("org_id"),
            trip_id: row.get("trip_id"),
            user_id: row.get("user_id"),
            session_id: row.get("session_id"),
            from_station: row.get("from_station"),
            to_station: row.get("to_station"),
            seat_ids: row.get("seat_ids"),
            segments: SegmentRange::new(
                from_db_index(row.get("segment_start"))?,
                from_db_index(row.get("segment_end"))?,
            ),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            status,
            client_ip: row.get("client_ip"),
            identity_documents: row.get("identity_documents"),
        })
    }

    fn row_to_booking(row: &sqlx::postgres::PgRow) -> Result<Booking, StoreError> {
        let status: String = row.get("status");
        let status = BookingStatus::parse(&status)
            .ok_or_else(|| StoreError::Invariant(format!("unknown booking status '{status}'")))?;
        let Json(passengers): Json<Vec<BookingPassenger>> = row
            .try_get("passengers")
            .map_err(|e| StoreError::Invariant(format!("passengers: {e}")))?;
        let Json(tickets): Json<Vec<SeatTicket>> = row
            .try_get("tickets")
            .map_err(|e| StoreError::Invariant(format!("tickets: {e}")))?;
        Ok(Booking {
            booking_id: row.get("booking_id"),
            hold_id: row.get("hold_id"),
            order_id: row.get("order_id"),
            org_id: row.get("org_id"),
            trip_id: row.get("trip_id"),
            user_id: row.get("user_id"),
            seat_ids: row.get("seat_ids"),
            segments: SegmentRange::new(
                from_db_index(row.get("segment_start"))?,
                from_db_index(row.get("segment_end"))?,
            ),
            passengers,
            tickets,
            status,
            created_at: row.get("created_at"),
            client_ip: row.get("client_ip"),
            identity_documents: row.get("identity_documents"),
        })
    }
}

impl InventoryStore for PgInventoryStore {
    fn initialize_trip<'a>(&'a self, manifest: &'a TripManifest) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            let inserted = sqlx::query(
                r"
                INSERT INTO inventory_trips (org_id, trip_id, manifest)
                VALUES ($1, $2, $3)
                ON CONFLICT (org_id, trip_id) DO NOTHING
                ",
            )
            .bind(&manifest.org_id)
            .bind(&manifest.trip_id)
            .bind(Json(manifest))
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await.map_err(unavailable)?;
                return Ok(false);
            }

            let segments = manifest.segment_count();
            let capacity = manifest.seats.len() * segments as usize;
            let mut indices = Vec::with_capacity(capacity);
            let mut seat_ids = Vec::with_capacity(capacity);
            let mut statuses = Vec::with_capacity(capacity);
            for segment in 0..segments {
                let segment = to_db_index(segment)?;
                for seat in &manifest.seats {
                    indices.push(segment);
                    seat_ids.push(seat.seat_id.clone());
                    statuses.push(if seat.blocked { STATUS_BLOCKED } else { STATUS_AVAILABLE });
                }
            }

            sqlx::query(
                r"
                INSERT INTO seat_segments (org_id, trip_id, segment_index, seat_id, status)
                SELECT $1, $2, s.segment_index, s.seat_id, s.status
                FROM UNNEST($3::int[], $4::text[], $5::text[]) AS s(segment_index, seat_id, status)
                ",
            )
            .bind(&manifest.org_id)
            .bind(&manifest.trip_id)
            .bind(indices)
            .bind(seat_ids)
            .bind(statuses)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            tx.commit().await.map_err(unavailable)?;

            tracing::info!(
                org_id = %manifest.org_id,
                trip_id = %manifest.trip_id,
                segments,
                seats = manifest.seats.len(),
                "Trip inventory initialized"
            );
            Ok(true)
        })
    }

    fn trip<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
    ) -> StoreFuture<'a, Option<TripManifest>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT manifest FROM inventory_trips WHERE org_id = $1 AND trip_id = $2",
            )
            .bind(org_id)
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

            row.map(|row| {
                row.try_get::<Json<TripManifest>, _>("manifest")
                    .map(|Json(manifest)| manifest)
                    .map_err(|e| StoreError::Invariant(format!("manifest: {e}")))
            })
            .transpose()
        })
    }

    fn rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        segments: SegmentRange,
    ) -> StoreFuture<'a, Vec<SeatSegmentRow>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT segment_index, seat_id, status, hold_id, user_id, hold_expires_at, booking_id
                FROM seat_segments
                WHERE org_id = $1 AND trip_id = $2
                  AND segment_index >= $3 AND segment_index < $4
                ORDER BY segment_index, seat_id
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(to_db_index(segments.start)?)
            .bind(to_db_index(segments.end)?)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

            rows.iter()
                .map(|row| {
                    Ok(SeatSegmentRow {
                        trip_id: trip_id.to_string(),
                        segment_index: from_db_index(row.get("segment_index"))?,
                        seat_id: row.get("seat_id"),
                        state: Self::row_to_state(row)?,
                    })
                })
                .collect()
        })
    }

    fn claim_row<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        segment_index: u32,
        seat_id: &'a str,
        claim: &'a HoldClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE seat_segments
                SET status = 'held', hold_id = $5, user_id = $6, hold_expires_at = $7,
                    booking_id = NULL, updated_at = $8
                WHERE org_id = $1 AND trip_id = $2 AND segment_index = $3 AND seat_id = $4
                  AND (
                    status = 'available'
                    OR (status = 'held' AND (hold_expires_at <= $8 OR hold_id = $5))
                  )
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(to_db_index(segment_index)?)
            .bind(seat_id)
            .bind(claim.hold_id)
            .bind(&claim.user_id)
            .bind(claim.expires_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn release_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        hold_id: Uuid,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE seat_segments
                SET status = 'available', hold_id = NULL, user_id = NULL,
                    hold_expires_at = NULL, updated_at = NOW()
                WHERE org_id = $1 AND trip_id = $2 AND status = 'held' AND hold_id = $3
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(hold_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            Ok(result.rows_affected())
        })
    }

    fn convert_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        hold_id: Uuid,
        booking_id: Uuid,
        expected_rows: u64,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            let result = sqlx::query(
                r"
                UPDATE seat_segments
                SET status = 'booked', booking_id = $4, hold_id = NULL, user_id = NULL,
                    hold_expires_at = NULL, updated_at = NOW()
                WHERE org_id = $1 AND trip_id = $2 AND status = 'held' AND hold_id = $3
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(hold_id)
            .bind(booking_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            if result.rows_affected() != expected_rows {
                tracing::warn!(
                    %hold_id,
                    expected_rows,
                    found = result.rows_affected(),
                    "Hold rows drifted; conversion rolled back"
                );
                tx.rollback().await.map_err(unavailable)?;
                return Ok(false);
            }

            tx.commit().await.map_err(unavailable)?;
            Ok(true)
        })
    }

    fn cancel_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        booking_id: Uuid,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE seat_segments
                SET status = 'available', booking_id = NULL, updated_at = NOW()
                WHERE org_id = $1 AND trip_id = $2 AND status = 'booked' AND booking_id = $3
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(booking_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            Ok(result.rows_affected())
        })
    }

    fn set_blocked<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        seat_id: &'a str,
        blocked: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            let rows = sqlx::query(
                r"
                SELECT status, hold_id, user_id, hold_expires_at, booking_id
                FROM seat_segments
                WHERE org_id = $1 AND trip_id = $2 AND seat_id = $3
                FOR UPDATE
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(seat_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(unavailable)?;

            let mut occupied = rows.is_empty();
            for row in &rows {
                match Self::row_to_state(row)?.effective(now) {
                    SeatState::Available | SeatState::Blocked => {}
                    SeatState::Held { .. } | SeatState::Booked { .. } => occupied = true,
                }
            }
            if occupied {
                tx.rollback().await.map_err(unavailable)?;
                return Ok(false);
            }

            sqlx::query(
                r"
                UPDATE seat_segments
                SET status = $4, hold_id = NULL, user_id = NULL,
                    hold_expires_at = NULL, updated_at = $5
                WHERE org_id = $1 AND trip_id = $2 AND seat_id = $3
                ",
            )
            .bind(org_id)
            .bind(trip_id)
            .bind(seat_id)
            .bind(if blocked { STATUS_BLOCKED } else { STATUS_AVAILABLE })
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            tx.commit().await.map_err(unavailable)?;
            Ok(true)
        })
    }

    fn insert_hold<'a>(&'a self, hold: &'a SeatHold) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO seat_holds (
                    hold_id, org_id, trip_id, user_id, session_id, from_station, to_station,
                    seat_ids, segment_start, segment_end, created_at, expires_at, status,
                    client_ip, identity_documents
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(hold.hold_id)
            .bind(&hold.org_id)
            .bind(&hold.trip_id)
            .bind(&hold.user_id)
            .bind(&hold.session_id)
            .bind(&hold.from_station)
            .bind(&hold.to_station)
            .bind(&hold.seat_ids)
            .bind(to_db_index(hold.segments.start)?)
            .bind(to_db_index(hold.segments.end)?)
            .bind(hold.created_at)
            .bind(hold.expires_at)
            .bind(hold.status.as_str())
            .bind(&hold.client_ip)
            .bind(&hold.identity_documents)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            Ok(())
        })
    }

    fn hold(&self, hold_id: Uuid) -> StoreFuture<'_, Option<SeatHold>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM seat_holds WHERE hold_id = $1")
                .bind(hold_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
            row.as_ref().map(Self::row_to_hold).transpose()
        })
    }

    fn transition_hold(
        &self,
        hold_id: Uuid,
        from: HoldStatus,
        to: HoldStatus,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result =
                sqlx::query("UPDATE seat_holds SET status = $3 WHERE hold_id = $1 AND status = $2")
                    .bind(hold_id)
                    .bind(from.as_str())
                    .bind(to.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(unavailable)?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn count_live_holds<'a>(
        &'a self,
        org_id: &'a str,
        user_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*) FROM seat_holds
                WHERE org_id = $1 AND user_id = $2 AND status = 'active' AND expires_at > $3
                ",
            )
            .bind(org_id)
            .bind(user_id)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn expired_holds(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<SeatHold>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT * FROM seat_holds
                WHERE status = 'active' AND expires_at <= $1
                ORDER BY expires_at ASC
                LIMIT $2
                ",
            )
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
            rows.iter().map(Self::row_to_hold).collect()
        })
    }

    fn insert_booking<'a>(&'a self, booking: &'a Booking) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO bookings (
                    booking_id, hold_id, order_id, org_id, trip_id, user_id, seat_ids,
                    segment_start, segment_end, passengers, tickets, status, created_at,
                    client_ip, identity_documents
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(booking.booking_id)
            .bind(booking.hold_id)
            .bind(&booking.order_id)
            .bind(&booking.org_id)
            .bind(&booking.trip_id)
            .bind(&booking.user_id)
            .bind(&booking.seat_ids)
            .bind(to_db_index(booking.segments.start)?)
            .bind(to_db_index(booking.segments.end)?)
            .bind(Json(&booking.passengers))
            .bind(Json(&booking.tickets))
            .bind(booking.status.as_str())
            .bind(booking.created_at)
            .bind(&booking.client_ip)
            .bind(&booking.identity_documents)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            Ok(())
        })
    }

    fn booking(&self, booking_id: Uuid) -> StoreFuture<'_, Option<Booking>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM bookings WHERE booking_id = $1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
            row.as_ref().map(Self::row_to_booking).transpose()
        })
    }

    fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE bookings SET status = $3 WHERE booking_id = $1 AND status = $2",
            )
            .bind(booking_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            Ok(result.rows_affected() == 1)
        })
    }
}
