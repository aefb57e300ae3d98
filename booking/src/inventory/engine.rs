//! The inventory engine.
//!
//! Every public operation takes a [`Deadline`]. Store calls are retried with
//! bounded backoff inside it, and a hold's row mutations are additionally
//! capped by [`InventoryConfig::op_timeout`]. When the budget runs out mid-hold,
//! the rows already taken are released before the error is returned.
//!
//! Cache failures never fail an operation: pre-locks and tallies are skipped,
//! seat maps are read from the store, and cache writes are dropped.

use super::events::{SeatEventPublisher, SeatStatusChanged};
use super::prelock::{PreLockOutcome, PreLocks};
use super::seat_map::{self, SeatMap};
use super::segments::derive_segments;
use super::tallies::{TallyOutcome, TallySubject, TicketLimits, TicketTallies};
use super::{InventoryError, SeatConflict};
use crate::cache::MultiLevelCache;
use chrono::{DateTime, Utc};
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::error::{Classify, ErrorKind};
use seatline_core::event::event_types;
use seatline_core::inventory::{
    Booking, BookingPassenger, BookingStatus, HoldClaim, HoldStatus, InventoryStore, SeatClass,
    SeatHold, SeatSegmentRow, SeatSpec, SeatTicket, SeatType, SegmentRange, StoreError,
    TripManifest,
};
use seatline_runtime::metrics::InventoryMetrics;
use seatline_runtime::retry::{RetryPolicy, retry_transient};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Bound on the deferred pre-lock release.
const PRELOCK_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Hold lifetime when the request does not name one.
    pub hold_ttl: Duration,
    /// Live holds allowed per user.
    pub max_holds_per_user: u64,
    /// Pre-lock lease lifetime.
    pub prelock_ttl: Duration,
    /// Hard bound on a hold's row mutations.
    pub op_timeout: Duration,
    /// Lifetime of the cached seat-map snapshot.
    pub seat_map_ttl: Duration,
    /// Anti-scalping budgets.
    pub limits: TicketLimits,
    /// Backoff for authoritative-store calls.
    pub store_retry: RetryPolicy,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(600),
            max_holds_per_user: 2,
            prelock_ttl: Duration::from_secs(10),
            op_timeout: Duration::from_secs(2),
            seat_map_ttl: Duration::from_secs(5),
            limits: TicketLimits::default(),
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Input of [`InventoryEngine::hold_seats`].
#[derive(Debug, Clone)]
pub struct HoldRequest {
    /// Organisation.
    pub org_id: String,
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
    /// Seats wanted.
    pub seat_ids: Vec<String>,
    /// Buyer.
    pub user_id: String,
    /// Buyer's session.
    pub session_id: String,
    /// Hold lifetime; the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Buyer's IP, for anti-scalping.
    pub client_ip: Option<String>,
    /// One identity document per passenger, for anti-scalping.
    pub identity_documents: Vec<String>,
}

/// A granted hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldGranted {
    /// Hold id.
    pub hold_id: Uuid,
    /// Seats held, in allocation order.
    pub seat_ids: Vec<String>,
    /// Segments held.
    pub segments: SegmentRange,
    /// When the hold lapses.
    pub expires_at: DateTime<Utc>,
}

/// Result of [`InventoryEngine::release_seats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedHold {
    /// Hold id.
    pub hold_id: Uuid,
    /// Seats returned.
    pub seat_ids: Vec<String>,
    /// Rows moved back to AVAILABLE.
    pub released_rows: u64,
}

/// Input of [`InventoryEngine::confirm_booking`].
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    /// Organisation.
    pub org_id: String,
    /// Hold to convert.
    pub hold_id: Uuid,
    /// Order paying for it.
    pub order_id: String,
    /// Must own the hold.
    pub user_id: String,
    /// One passenger per held seat.
    pub passengers: Vec<BookingPassenger>,
}

/// A confirmed booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedBooking {
    /// Booking id.
    pub booking_id: Uuid,
    /// Seats booked.
    pub seat_ids: Vec<String>,
    /// One ticket per seat.
    pub tickets: Vec<SeatTicket>,
}

/// Result of [`InventoryEngine::cancel_booking`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledBooking {
    /// Booking id.
    pub booking_id: Uuid,
    /// Seats returned.
    pub seat_ids: Vec<String>,
    /// Rows moved back to AVAILABLE by this call.
    pub released_rows: u64,
    /// True if the booking was already cancelled.
    pub already_cancelled: bool,
}

/// Result of [`InventoryEngine::initialize_trip`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedTrip {
    /// Trip.
    pub trip_id: String,
    /// False if the trip already existed and nothing was written.
    pub created: bool,
    /// Segments per seat.
    pub segment_count: u32,
    /// Seat-segment rows in the grid.
    pub row_count: u64,
}

/// Input of [`InventoryEngine::check_availability`].
#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    /// Organisation.
    pub org_id: String,
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
    /// Seats wanted.
    pub quantity: u32,
    /// Restrict to one class.
    pub class: Option<SeatClass>,
}

/// A seat free on a whole journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableSeat {
    /// Seat id.
    pub seat_id: String,
    /// Printed number.
    pub number: String,
    /// Row.
    pub row: u32,
    /// Fare class.
    pub class: SeatClass,
    /// Position.
    pub seat_type: SeatType,
    /// Fare in paisa.
    pub price_paisa: i64,
}

/// Result of [`InventoryEngine::check_availability`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// At least `quantity` seats are free.
    pub is_available: bool,
    /// Seats free on the whole journey.
    pub available_count: usize,
    /// Those seats, by class then seat number.
    pub seats: Vec<AvailableSeat>,
    /// Fare of the first `quantity` seats.
    pub total_price_paisa: i64,
    /// Journey segments.
    pub segments: SegmentRange,
    /// Read time.
    pub checked_at: DateTime<Utc>,
}

/// Seat inventory over an authoritative store and the shared cache.
pub struct InventoryEngine {
    store: Arc<dyn InventoryStore>,
    cache: Arc<MultiLevelCache>,
    prelocks: PreLocks,
    tallies: TicketTallies,
    events: SeatEventPublisher,
    clock: Arc<dyn Clock>,
    config: InventoryConfig,
}

impl InventoryEngine {
    /// Create an engine. Seat events are dropped until [`with_events`](Self::with_events).
    #[must_use]
    pub fn new(
        store: Arc<dyn InventoryStore>,
        cache: Arc<MultiLevelCache>,
        clock: Arc<dyn Clock>,
        config: InventoryConfig,
    ) -> Self {
        let shared = Arc::clone(cache.shared());
        Self {
            store,
            prelocks: PreLocks::new(Arc::clone(&shared), config.prelock_ttl),
            tallies: TicketTallies::new(shared, config.limits),
            cache,
            events: SeatEventPublisher::disabled(),
            clock,
            config,
        }
    }

    /// Publish seat events through `events`.
    #[must_use]
    pub fn with_events(mut self, events: SeatEventPublisher) -> Self {
        self.events = events;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &InventoryConfig {
        &self.config
    }

    /// Write a trip's seat-segment grid, every row AVAILABLE (or BLOCKED for
    /// seats flagged in the manifest). Idempotent on the trip id.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidManifest`] for a malformed manifest, or a store error.
    pub async fn initialize_trip(
        &self,
        manifest: &TripManifest,
        deadline: Deadline,
    ) -> Result<InitializedTrip, InventoryError> {
        validate_manifest(manifest)?;

        let created = self
            .with_store(deadline, || self.store.initialize_trip(manifest))
            .await?;
        let segment_count = manifest.segment_count();
        let row_count = u64::from(segment_count) * manifest.seats.len() as u64;

        if created {
            tracing::info!(
                org_id = %manifest.org_id,
                trip_id = %manifest.trip_id,
                segments = segment_count,
                rows = row_count,
                "Trip inventory initialized"
            );
        } else {
            tracing::debug!(trip_id = %manifest.trip_id, "Trip inventory already present");
        }

        Ok(InitializedTrip {
            trip_id: manifest.trip_id.clone(),
            created,
            segment_count,
            row_count,
        })
    }

    /// Seats free on every segment of a journey, cheapest class first.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRange`], [`InventoryError::TripNotFound`] or a store error.
    pub async fn check_availability(
        &self,
        query: &AvailabilityQuery,
        deadline: Deadline,
    ) -> Result<Availability, InventoryError> {
        let manifest = self.load_trip(&query.org_id, &query.trip_id, deadline).await?;
        let segments = derive_segments(&manifest.stops, &query.from, &query.to)?;
        let rows = self
            .with_store(deadline, || {
                self.store.rows(&query.org_id, &query.trip_id, segments)
            })
            .await?;

        let now = self.clock.now();
        let free = free_seats(&rows, segments, now);
        let mut seats: Vec<&SeatSpec> = manifest
            .seats
            .iter()
            .filter(|s| free.contains(s.seat_id.as_str()))
            .filter(|s| query.class.is_none_or(|class| s.class == class))
            .collect();
        seats.sort_by(|a, b| allocation_order(a, b));

        let wanted = usize::try_from(query.quantity).unwrap_or(usize::MAX);
        let total_price_paisa = seats.iter().take(wanted).map(|s| s.price_paisa).sum();

        Ok(Availability {
            is_available: seats.len() >= wanted,
            available_count: seats.len(),
            seats: seats.into_iter().map(available_seat).collect(),
            total_price_paisa,
            segments,
            checked_at: now,
        })
    }

    /// Hold seats for a journey, all or nothing.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::TooManyHolds`] / [`InventoryError::TicketLimit`] from anti-scalping
    /// - [`InventoryError::NotAvailable`] naming every blocking row
    /// - [`InventoryError::Contention`] if another attempt holds a pre-lock
    /// - [`InventoryError::InvalidRange`], [`InventoryError::UnknownSeat`]
    /// - [`InventoryError::Timeout`] if the deadline passes mid-hold
    pub async fn hold_seats(
        &self,
        request: HoldRequest,
        deadline: Deadline,
    ) -> Result<HoldGranted, InventoryError> {
        let started = Instant::now();
        let result = self.try_hold(request, deadline).await;
        let label = match &result {
            Ok(_) => "granted",
            Err(e) => match e.kind() {
                ErrorKind::Conflict => "conflict",
                ErrorKind::Precondition | ErrorKind::NotFound => "rejected",
                _ => "error",
            },
        };
        InventoryMetrics::record_hold(label, started.elapsed());
        result
    }

    async fn try_hold(
        &self,
        request: HoldRequest,
        deadline: Deadline,
    ) -> Result<HoldGranted, InventoryError> {
        if request.seat_ids.is_empty() {
            return Err(InventoryError::EmptySelection);
        }
        let deadline = deadline.tighten(self.config.op_timeout);

        let manifest = self.load_trip(&request.org_id, &request.trip_id, deadline).await?;
        let segments = derive_segments(&manifest.stops, &request.from, &request.to)?;
        let seat_ids = order_seats(&manifest, &request.seat_ids)?;

        let now = self.clock.now();
        let live = self
            .with_store(deadline, || {
                self.store
                    .count_live_holds(&request.org_id, &request.user_id, now)
            })
            .await?;
        if live >= self.config.max_holds_per_user {
            return Err(InventoryError::TooManyHolds {
                limit: self.config.max_holds_per_user,
            });
        }

        let subject = TallySubject {
            trip_id: &request.trip_id,
            user_id: &request.user_id,
            client_ip: request.client_ip.as_deref(),
            identity_documents: &request.identity_documents,
        };
        let quantity = i64::try_from(seat_ids.len()).unwrap_or(i64::MAX);
        let tallied = match self.tallies.reserve(subject, quantity).await {
            TallyOutcome::Reserved => true,
            TallyOutcome::Skipped => false,
            TallyOutcome::Exceeded(reason) => return Err(InventoryError::TicketLimit(reason)),
        };

        let result = self
            .claim(&request, &seat_ids, segments, now, deadline)
            .await;
        if result.is_err() && tallied {
            self.tallies.release(subject, quantity).await;
        }
        let hold = result?;

        self.write_hold_metadata(&hold).await;
        self.invalidate_seat_map(&hold.org_id, &hold.trip_id);
        self.events
            .publish(
                event_types::SEATS_HELD,
                &SeatStatusChanged::new(&hold.trip_id, &hold.seat_ids, "HELD", segments, now),
            )
            .await;

        tracing::info!(
            hold_id = %hold.hold_id,
            trip_id = %hold.trip_id,
            user_id = %hold.user_id,
            seats = hold.seat_ids.len(),
            segment_from = segments.start,
            segment_to = segments.end,
            "Seats held"
        );

        Ok(HoldGranted {
            hold_id: hold.hold_id,
            seat_ids: hold.seat_ids,
            segments,
            expires_at: hold.expires_at,
        })
    }

    /// Pre-lock, pre-check, CAS every row, then persist the hold record.
    async fn claim(
        &self,
        request: &HoldRequest,
        seat_ids: &[String],
        segments: SegmentRange,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<SeatHold, InventoryError> {
        let org_id = request.org_id.as_str();
        let trip_id = request.trip_id.as_str();
        let hold_id = Uuid::new_v4();
        let ttl = request
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.config.hold_ttl);
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10));

        let keys = seat_ids
            .iter()
            .flat_map(|seat| {
                segments
                    .iter()
                    .map(move |seg| PreLocks::key(org_id, trip_id, seg, seat))
            })
            .collect();
        let (outcome, guard) = self.prelocks.acquire(keys, &hold_id.to_string()).await;
        if let PreLockOutcome::Contended { .. } = outcome {
            return Err(InventoryError::Contention);
        }

        let result = self
            .claim_rows(
                org_id,
                trip_id,
                seat_ids,
                segments,
                hold_id,
                &request.user_id,
                expires_at,
                now,
                deadline,
            )
            .await;
        self.prelocks.release_later(guard, PRELOCK_RELEASE_TIMEOUT);
        result?;

        let hold = SeatHold {
            hold_id,
            org_id: org_id.to_string(),
            trip_id: trip_id.to_string(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            from_station: request.from.clone(),
            to_station: request.to.clone(),
            seat_ids: seat_ids.to_vec(),
            segments,
            created_at: now,
            expires_at,
            status: HoldStatus::Active,
            client_ip: request.client_ip.clone(),
            identity_documents: request.identity_documents.clone(),
        };

        if let Err(e) = self.with_store(deadline, || self.store.insert_hold(&hold)).await {
            tracing::error!(hold_id = %hold_id, error = %e, "Failed to record hold, rolling back rows");
            self.rollback(org_id, trip_id, hold_id).await;
            return Err(e);
        }

        Ok(hold)
    }

    #[allow(clippy::too_many_arguments)]
    async fn claim_rows(
        &self,
        org_id: &str,
        trip_id: &str,
        seat_ids: &[String],
        segments: SegmentRange,
        hold_id: Uuid,
        user_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<(), InventoryError> {
        let rows = self
            .with_store(deadline, || self.store.rows(org_id, trip_id, segments))
            .await?;
        let conflicts = conflicts_in(&rows, seat_ids, now);
        if !conflicts.is_empty() {
            return Err(InventoryError::NotAvailable { conflicts });
        }

        let claim = HoldClaim {
            hold_id,
            user_id: user_id.to_string(),
            expires_at,
        };
        let attempt = async {
            for seat_id in seat_ids {
                for segment in segments.iter() {
                    let won = self
                        .with_store(deadline, || {
                            self.store
                                .claim_row(org_id, trip_id, segment, seat_id, &claim, now)
                        })
                        .await?;
                    if !won {
                        return Ok(Some((seat_id.clone(), segment)));
                    }
                }
            }
            Ok::<_, InventoryError>(None)
        };

        match deadline.run(attempt).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some((seat_id, segment)))) => {
                self.rollback(org_id, trip_id, hold_id).await;
                let status = self
                    .row_status(org_id, trip_id, segment, &seat_id, now)
                    .await;
                tracing::debug!(%hold_id, seat_id, segment, status, "Lost seat race");
                Err(InventoryError::NotAvailable {
                    conflicts: vec![SeatConflict {
                        seat_id,
                        segment_index: segment,
                        status,
                    }],
                })
            }
            Ok(Err(e)) => {
                self.rollback(org_id, trip_id, hold_id).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(%hold_id, trip_id, "Hold deadline exceeded, rolling back");
                self.rollback(org_id, trip_id, hold_id).await;
                Err(InventoryError::Timeout)
            }
        }
    }

    /// Return a hold's seats to AVAILABLE.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::HoldNotFound`] if the hold is unknown, already released or converted
    /// - [`InventoryError::NotOwner`] if `user_id` does not own it
    /// - [`InventoryError::HoldExpired`] if it lapsed (its rows are reaped)
    pub async fn release_seats(
        &self,
        org_id: &str,
        hold_id: Uuid,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<ReleasedHold, InventoryError> {
        let hold = self.load_hold(org_id, hold_id, deadline).await?;
        if hold.user_id != user_id {
            return Err(InventoryError::NotOwner(hold_id));
        }
        if hold.status != HoldStatus::Active {
            return Err(InventoryError::HoldNotFound(hold_id));
        }
        let now = self.clock.now();
        if !hold.is_live(now) {
            self.expire_hold(&hold).await;
            return Err(InventoryError::HoldExpired(hold_id));
        }

        let released_rows = self
            .with_store(deadline, || {
                self.store.release_rows(&hold.org_id, &hold.trip_id, hold_id)
            })
            .await?;
        if released_rows == 0 {
            // Converted or reaped concurrently.
            return Err(InventoryError::HoldNotFound(hold_id));
        }
        let transitioned = self
            .with_store(deadline, || {
                self.store
                    .transition_hold(hold_id, HoldStatus::Active, HoldStatus::Released)
            })
            .await?;
        if transitioned {
            self.release_tallies(&hold).await;
        } else {
            tracing::warn!(%hold_id, "Hold changed status during release");
        }

        self.after_release(&hold, now).await;
        tracing::info!(%hold_id, trip_id = %hold.trip_id, released_rows, "Hold released");

        Ok(ReleasedHold {
            hold_id,
            seat_ids: hold.seat_ids,
            released_rows,
        })
    }

    /// Check that `user_id` owns a live hold.
    ///
    /// # Errors
    ///
    /// [`InventoryError::HoldNotFound`], [`InventoryError::NotOwner`] or
    /// [`InventoryError::HoldExpired`].
    pub async fn verify_hold(
        &self,
        org_id: &str,
        hold_id: Uuid,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<SeatHold, InventoryError> {
        let hold = self.load_hold(org_id, hold_id, deadline).await?;
        if hold.user_id != user_id {
            return Err(InventoryError::NotOwner(hold_id));
        }
        if hold.status != HoldStatus::Active || !hold.is_live(self.clock.now()) {
            return Err(InventoryError::HoldExpired(hold_id));
        }
        Ok(hold)
    }

    /// Manifest entries for `seat_ids` on a journey, deduplicated and in
    /// allocation order. Availability is not checked.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRange`], [`InventoryError::UnknownSeat`],
    /// [`InventoryError::EmptySelection`] or [`InventoryError::TripNotFound`].
    pub async fn quote(
        &self,
        org_id: &str,
        trip_id: &str,
        from: &str,
        to: &str,
        seat_ids: &[String],
        deadline: Deadline,
    ) -> Result<Vec<SeatSpec>, InventoryError> {
        if seat_ids.is_empty() {
            return Err(InventoryError::EmptySelection);
        }
        let manifest = self.load_trip(org_id, trip_id, deadline).await?;
        derive_segments(&manifest.stops, from, to)?;
        let ordered = order_seats(&manifest, seat_ids)?;
        Ok(ordered
            .iter()
            .filter_map(|id| manifest.seat(id).cloned())
            .collect())
    }

    /// Turn a live hold into a booking, one ticket per seat.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::HoldExpired`] if the hold is not active, lapsed, or lost rows
    /// - [`InventoryError::CountMismatch`] if passengers and seats differ
    /// - [`InventoryError::HoldNotFound`] / [`InventoryError::NotOwner`]
    pub async fn confirm_booking(
        &self,
        request: ConfirmRequest,
        deadline: Deadline,
    ) -> Result<ConfirmedBooking, InventoryError> {
        let hold_id = request.hold_id;
        let hold = self.load_hold(&request.org_id, hold_id, deadline).await?;
        if hold.user_id != request.user_id {
            return Err(InventoryError::NotOwner(hold_id));
        }
        let now = self.clock.now();
        if hold.status != HoldStatus::Active {
            return Err(InventoryError::HoldExpired(hold_id));
        }
        if !hold.is_live(now) {
            self.expire_hold(&hold).await;
            return Err(InventoryError::HoldExpired(hold_id));
        }
        if request.passengers.len() != hold.seat_ids.len() {
            return Err(InventoryError::CountMismatch {
                seats: hold.seat_ids.len(),
                passengers: request.passengers.len(),
            });
        }

        let booking_id = Uuid::new_v4();
        let expected_rows = hold.seat_ids.len() as u64 * u64::from(hold.segments.len());
        let converted = self
            .with_store(deadline, || {
                self.store
                    .convert_rows(&hold.org_id, &hold.trip_id, hold_id, booking_id, expected_rows)
            })
            .await?;
        if !converted {
            tracing::warn!(%hold_id, "Hold lost rows before confirmation");
            return Err(InventoryError::HoldExpired(hold_id));
        }

        match self
            .with_store(deadline, || {
                self.store
                    .transition_hold(hold_id, HoldStatus::Active, HoldStatus::Converted)
            })
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::error!(%hold_id, "Converted hold was no longer active"),
            Err(e) => tracing::error!(%hold_id, error = %e, "Failed to mark hold converted"),
        }

        let tickets: Vec<SeatTicket> = hold
            .seat_ids
            .iter()
            .map(|seat_id| SeatTicket {
                seat_id: seat_id.clone(),
                ticket_id: Uuid::new_v4(),
            })
            .collect();
        let booking = Booking {
            booking_id,
            hold_id,
            order_id: request.order_id.clone(),
            org_id: hold.org_id.clone(),
            trip_id: hold.trip_id.clone(),
            user_id: hold.user_id.clone(),
            seat_ids: hold.seat_ids.clone(),
            segments: hold.segments,
            passengers: seat_passengers(&hold.seat_ids, request.passengers),
            tickets: tickets.clone(),
            status: BookingStatus::Confirmed,
            created_at: now,
            client_ip: hold.client_ip.clone(),
            identity_documents: hold.identity_documents.clone(),
        };

        if let Err(e) = self.with_store(deadline, || self.store.insert_booking(&booking)).await {
            tracing::error!(%booking_id, error = %e, "Failed to record booking, returning seats");
            if let Err(undo) = self
                .with_store(Deadline::none(), || {
                    self.store.cancel_rows(&hold.org_id, &hold.trip_id, booking_id)
                })
                .await
            {
                tracing::error!(%booking_id, error = %undo, "Failed to return seats of unrecorded booking");
            }
            return Err(e);
        }

        self.delete_hold_metadata(&hold).await;
        self.invalidate_seat_map(&hold.org_id, &hold.trip_id);
        self.events
            .publish(
                event_types::SEATS_BOOKED,
                &SeatStatusChanged::new(&hold.trip_id, &hold.seat_ids, "BOOKED", hold.segments, now),
            )
            .await;

        tracing::info!(
            %booking_id,
            %hold_id,
            order_id = %request.order_id,
            seats = hold.seat_ids.len(),
            "Booking confirmed"
        );

        Ok(ConfirmedBooking {
            booking_id,
            seat_ids: hold.seat_ids,
            tickets,
        })
    }

    /// Return a booking's seats to AVAILABLE. Cancelling twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`InventoryError::BookingNotFound`] or a store error.
    pub async fn cancel_booking(
        &self,
        org_id: &str,
        booking_id: Uuid,
        deadline: Deadline,
    ) -> Result<CancelledBooking, InventoryError> {
        let booking = self
            .with_store(deadline, || self.store.booking(booking_id))
            .await?
            .filter(|b| b.org_id == org_id)
            .ok_or(InventoryError::BookingNotFound(booking_id))?;

        if booking.status == BookingStatus::Cancelled {
            return Ok(CancelledBooking {
                booking_id,
                seat_ids: booking.seat_ids,
                released_rows: 0,
                already_cancelled: true,
            });
        }

        let released_rows = self
            .with_store(deadline, || {
                self.store.cancel_rows(org_id, &booking.trip_id, booking_id)
            })
            .await?;
        let transitioned = self
            .with_store(deadline, || {
                self.store.transition_booking(
                    booking_id,
                    BookingStatus::Confirmed,
                    BookingStatus::Cancelled,
                )
            })
            .await?;
        if !transitioned {
            return Ok(CancelledBooking {
                booking_id,
                seat_ids: booking.seat_ids,
                released_rows,
                already_cancelled: true,
            });
        }

        let quantity = i64::try_from(booking.seat_ids.len()).unwrap_or(i64::MAX);
        self.tallies
            .release(
                TallySubject {
                    trip_id: &booking.trip_id,
                    user_id: &booking.user_id,
                    client_ip: booking.client_ip.as_deref(),
                    identity_documents: &booking.identity_documents,
                },
                quantity,
            )
            .await;
        self.invalidate_seat_map(org_id, &booking.trip_id);
        self.events
            .publish(
                event_types::SEATS_RELEASED,
                &SeatStatusChanged::new(
                    &booking.trip_id,
                    &booking.seat_ids,
                    "AVAILABLE",
                    booking.segments,
                    self.clock.now(),
                ),
            )
            .await;

        tracing::info!(%booking_id, trip_id = %booking.trip_id, released_rows, "Booking cancelled");

        Ok(CancelledBooking {
            booking_id,
            seat_ids: booking.seat_ids,
            released_rows,
            already_cancelled: false,
        })
    }

    /// Rendered seat map for a journey, read through the seat-map cache.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRange`], [`InventoryError::TripNotFound`] or a store error.
    pub async fn get_seat_map(
        &self,
        org_id: &str,
        trip_id: &str,
        from: &str,
        to: &str,
        deadline: Deadline,
    ) -> Result<SeatMap, InventoryError> {
        let manifest = self.load_trip(org_id, trip_id, deadline).await?;
        let segments = derive_segments(&manifest.stops, from, to)?;

        let key = seat_map_key(org_id, trip_id);
        let snapshot = match self.cache.get_json::<Vec<SeatSegmentRow>>(&key).await {
            Some(rows) => rows,
            None => {
                let all = SegmentRange::new(0, manifest.segment_count());
                let rows = self
                    .with_store(deadline, || self.store.rows(org_id, trip_id, all))
                    .await?;
                self.cache
                    .set_json(&key, &rows, Some(self.config.seat_map_ttl))
                    .await;
                rows
            }
        };

        Ok(seat_map::render(
            &manifest,
            &snapshot,
            from,
            to,
            segments,
            self.clock.now(),
        ))
    }

    /// Block or unblock a seat on every segment.
    ///
    /// # Errors
    ///
    /// [`InventoryError::SeatBusy`] if any row is held or booked,
    /// [`InventoryError::UnknownSeat`], [`InventoryError::TripNotFound`].
    pub async fn set_seat_blocked(
        &self,
        org_id: &str,
        trip_id: &str,
        seat_id: &str,
        blocked: bool,
        deadline: Deadline,
    ) -> Result<(), InventoryError> {
        let manifest = self.load_trip(org_id, trip_id, deadline).await?;
        if manifest.seat(seat_id).is_none() {
            return Err(InventoryError::UnknownSeat(seat_id.to_string()));
        }

        let now = self.clock.now();
        let changed = self
            .with_store(deadline, || {
                self.store
                    .set_blocked(org_id, trip_id, seat_id, blocked, now)
            })
            .await?;
        if !changed {
            return Err(InventoryError::SeatBusy(seat_id.to_string()));
        }

        self.invalidate_seat_map(org_id, trip_id);
        tracing::info!(trip_id, seat_id, blocked, "Seat block state changed");
        Ok(())
    }

    /// Reap up to `limit` lapsed holds. Returns how many were expired.
    ///
    /// # Errors
    ///
    /// Returns a store error if the expired holds cannot be listed.
    pub async fn sweep_expired(&self, limit: usize) -> Result<usize, InventoryError> {
        let now = self.clock.now();
        let holds = self
            .with_store(Deadline::none(), || self.store.expired_holds(now, limit))
            .await?;

        let mut expired = 0;
        for hold in &holds {
            if self.expire_hold(hold).await {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired holds reaped");
        }
        Ok(expired)
    }

    /// Move a lapsed hold's rows back and mark it EXPIRED. Returns true if this
    /// call made the transition.
    async fn expire_hold(&self, hold: &SeatHold) -> bool {
        let released = match self
            .with_store(Deadline::none(), || {
                self.store.release_rows(&hold.org_id, &hold.trip_id, hold.hold_id)
            })
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(hold_id = %hold.hold_id, error = %e, "Failed to reap expired hold");
                return false;
            }
        };

        let expired = match self
            .with_store(Deadline::none(), || {
                self.store
                    .transition_hold(hold.hold_id, HoldStatus::Active, HoldStatus::Expired)
            })
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(hold_id = %hold.hold_id, error = %e, "Failed to mark hold expired");
                false
            }
        };

        if expired {
            tracing::debug!(hold_id = %hold.hold_id, released, "Hold expired");
            // Rows may already belong to a newer hold; the tallies are still ours.
            self.release_tallies(hold).await;
            if released > 0 {
                self.after_release(hold, self.clock.now()).await;
            } else {
                self.delete_hold_metadata(hold).await;
            }
        }
        expired
    }

    /// Give back a hold's ticket tallies. Called once, by whoever moved the
    /// hold out of ACTIVE.
    async fn release_tallies(&self, hold: &SeatHold) {
        let quantity = i64::try_from(hold.seat_ids.len()).unwrap_or(i64::MAX);
        self.tallies
            .release(
                TallySubject {
                    trip_id: &hold.trip_id,
                    user_id: &hold.user_id,
                    client_ip: hold.client_ip.as_deref(),
                    identity_documents: &hold.identity_documents,
                },
                quantity,
            )
            .await;
    }

    async fn after_release(&self, hold: &SeatHold, now: DateTime<Utc>) {
        self.delete_hold_metadata(hold).await;
        self.invalidate_seat_map(&hold.org_id, &hold.trip_id);
        self.events
            .publish(
                event_types::SEATS_RELEASED,
                &SeatStatusChanged::new(&hold.trip_id, &hold.seat_ids, "AVAILABLE", hold.segments, now),
            )
            .await;
    }

    async fn rollback(&self, org_id: &str, trip_id: &str, hold_id: Uuid) {
        match self
            .with_store(Deadline::none(), || {
                self.store.release_rows(org_id, trip_id, hold_id)
            })
            .await
        {
            Ok(rows) => tracing::debug!(%hold_id, rows, "Partial hold rolled back"),
            Err(e) => {
                tracing::error!(%hold_id, error = %e, "Rollback failed, rows stay held until expiry");
            }
        }
    }

    async fn row_status(
        &self,
        org_id: &str,
        trip_id: &str,
        segment: u32,
        seat_id: &str,
        now: DateTime<Utc>,
    ) -> String {
        let range = SegmentRange::new(segment, segment + 1);
        self.store
            .rows(org_id, trip_id, range)
            .await
            .ok()
            .and_then(|rows| rows.into_iter().find(|r| r.seat_id == seat_id))
            .map_or("UNKNOWN", |r| r.state.effective(now).label())
            .to_string()
    }

    async fn load_trip(
        &self,
        org_id: &str,
        trip_id: &str,
        deadline: Deadline,
    ) -> Result<TripManifest, InventoryError> {
        let key = format!("inventory:cache:trip:{org_id}:{trip_id}");
        if let Some(manifest) = self.cache.get_json::<TripManifest>(&key).await {
            return Ok(manifest);
        }

        let manifest = self
            .with_store(deadline, || self.store.trip(org_id, trip_id))
            .await?
            .ok_or_else(|| InventoryError::TripNotFound(trip_id.to_string()))?;
        self.cache.set_json(&key, &manifest, None).await;
        Ok(manifest)
    }

    async fn load_hold(
        &self,
        org_id: &str,
        hold_id: Uuid,
        deadline: Deadline,
    ) -> Result<SeatHold, InventoryError> {
        let key = hold_key(org_id, hold_id);
        match self.cache.shared().get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<SeatHold>(&raw) {
                Ok(hold) if hold.org_id == org_id => return Ok(hold),
                Ok(_) => {}
                Err(e) => tracing::error!(%hold_id, error = %e, "Corrupt hold metadata"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(%hold_id, error = %e, "Hold metadata unavailable, reading store"),
        }

        self.with_store(deadline, || self.store.hold(hold_id))
            .await?
            .filter(|h| h.org_id == org_id)
            .ok_or(InventoryError::HoldNotFound(hold_id))
    }

    async fn write_hold_metadata(&self, hold: &SeatHold) {
        let ttl = (hold.expires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        let raw = match serde_json::to_string(hold) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(hold_id = %hold.hold_id, error = %e, "Failed to encode hold metadata");
                return;
            }
        };
        let key = hold_key(&hold.org_id, hold.hold_id);
        if let Err(e) = self.cache.shared().set(&key, &raw, ttl).await {
            tracing::warn!(hold_id = %hold.hold_id, error = %e, "Failed to cache hold metadata");
        }
    }

    async fn delete_hold_metadata(&self, hold: &SeatHold) {
        let key = hold_key(&hold.org_id, hold.hold_id);
        if let Err(e) = self.cache.shared().delete(&key).await {
            tracing::warn!(hold_id = %hold.hold_id, error = %e, "Failed to drop hold metadata");
        }
    }

    /// Drop this node's copy now and the shared copy in the background.
    fn invalidate_seat_map(&self, org_id: &str, trip_id: &str) {
        let key = seat_map_key(org_id, trip_id);
        self.cache.invalidate_local(&key);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(
            async move {
                cache.delete(&key).await;
            }
            .instrument(tracing::Span::current()),
        );
    }

    async fn with_store<T, F, Fut>(&self, deadline: Deadline, op: F) -> Result<T, InventoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_transient(&self.config.store_retry, deadline, op)
            .await
            .map_err(InventoryError::from)
    }
}

/// Cache key of a trip's seat-map snapshot.
#[must_use]
pub fn seat_map_key(org_id: &str, trip_id: &str) -> String {
    format!("inventory:cache:seatmap:{org_id}:{trip_id}")
}

fn hold_key(org_id: &str, hold_id: Uuid) -> String {
    format!("hold:{org_id}:{hold_id}")
}

fn validate_manifest(manifest: &TripManifest) -> Result<(), InventoryError> {
    let invalid = |reason: &str| Err(InventoryError::InvalidManifest(reason.to_string()));

    if manifest.trip_id.is_empty() || manifest.org_id.is_empty() {
        return invalid("trip and organisation ids are required");
    }
    if manifest.stops.len() < 2 {
        return invalid("a trip needs at least two stops");
    }
    let mut stops = HashSet::new();
    if !manifest.stops.iter().all(|s| stops.insert(s.as_str())) {
        return invalid("stops must be distinct");
    }
    if manifest.seats.is_empty() {
        return invalid("a trip needs at least one seat");
    }
    let mut seats = HashSet::new();
    for seat in &manifest.seats {
        if !seats.insert(seat.seat_id.as_str()) {
            return Err(InventoryError::InvalidManifest(format!(
                "duplicate seat {}",
                seat.seat_id
            )));
        }
        if seat.price_paisa < 0 {
            return Err(InventoryError::InvalidManifest(format!(
                "negative price for seat {}",
                seat.seat_id
            )));
        }
    }
    Ok(())
}

/// Class priority, then row, then seat number.
fn allocation_order(a: &SeatSpec, b: &SeatSpec) -> std::cmp::Ordering {
    a.class
        .cmp(&b.class)
        .then(a.row.cmp(&b.row))
        .then_with(|| a.number.cmp(&b.number))
}

/// Validate and deduplicate requested seats, in allocation order.
fn order_seats(manifest: &TripManifest, requested: &[String]) -> Result<Vec<String>, InventoryError> {
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(requested.len());
    for seat_id in requested {
        if !seen.insert(seat_id.as_str()) {
            continue;
        }
        let spec = manifest
            .seat(seat_id)
            .ok_or_else(|| InventoryError::UnknownSeat(seat_id.clone()))?;
        specs.push(spec);
    }
    specs.sort_by(|a, b| allocation_order(a, b));
    Ok(specs.into_iter().map(|s| s.seat_id.clone()).collect())
}

/// Seats claimable on every segment of `segments`.
fn free_seats(rows: &[SeatSegmentRow], segments: SegmentRange, now: DateTime<Utc>) -> HashSet<&str> {
    let mut claimable: HashMap<&str, u32> = HashMap::new();
    let mut taken: HashSet<&str> = HashSet::new();
    for row in rows.iter().filter(|r| segments.contains(r.segment_index)) {
        if row.state.is_claimable(now) {
            *claimable.entry(row.seat_id.as_str()).or_default() += 1;
        } else {
            taken.insert(row.seat_id.as_str());
        }
    }
    claimable
        .into_iter()
        .filter(|(seat, count)| *count == segments.len() && !taken.contains(seat))
        .map(|(seat, _)| seat)
        .collect()
}

fn conflicts_in(rows: &[SeatSegmentRow], seat_ids: &[String], now: DateTime<Utc>) -> Vec<SeatConflict> {
    let wanted: HashSet<&str> = seat_ids.iter().map(String::as_str).collect();
    rows.iter()
        .filter(|r| wanted.contains(r.seat_id.as_str()) && !r.state.is_claimable(now))
        .map(|r| SeatConflict {
            seat_id: r.seat_id.clone(),
            segment_index: r.segment_index,
            status: r.state.label().to_string(),
        })
        .collect()
}

/// Pair passengers with seats: a passenger naming one of the held seats keeps
/// it, the rest fill the remaining seats in order.
fn seat_passengers(seat_ids: &[String], passengers: Vec<BookingPassenger>) -> Vec<BookingPassenger> {
    let mut free: Vec<&String> = seat_ids
        .iter()
        .filter(|seat| !passengers.iter().any(|p| &p.seat_id == *seat))
        .collect();
    free.reverse();

    let mut claimed = HashSet::new();
    passengers
        .into_iter()
        .map(|mut passenger| {
            let keeps = seat_ids.contains(&passenger.seat_id)
                && claimed.insert(passenger.seat_id.clone());
            if !keeps {
                if let Some(seat) = free.pop() {
                    passenger.seat_id.clone_from(seat);
                }
            }
            passenger
        })
        .collect()
}

fn available_seat(spec: &SeatSpec) -> AvailableSeat {
    AvailableSeat {
        seat_id: spec.seat_id.clone(),
        number: spec.number.clone(),
        row: spec.row,
        class: spec.class,
        seat_type: spec.seat_type,
        price_paisa: spec.price_paisa,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use seatline_core::cache::SharedCache;
    use seatline_testing::{InMemoryCache, InMemoryEventBus, InMemoryInventoryStore, MockClock};
    use seatline_core::event::topics;
    use seatline_core::inventory::SeatState;

    struct Harness {
        engine: InventoryEngine,
        store: InMemoryInventoryStore,
        cache: Arc<InMemoryCache>,
        bus: Arc<InMemoryEventBus>,
        clock: MockClock,
    }

    fn seat(id: &str, class: SeatClass, number: &str, price: i64) -> SeatSpec {
        SeatSpec {
            seat_id: id.to_string(),
            number: number.to_string(),
            row: 1,
            class,
            seat_type: SeatType::Aisle,
            price_paisa: price,
            blocked: false,
        }
    }

    fn manifest() -> TripManifest {
        TripManifest {
            org_id: "org".to_string(),
            trip_id: "t1".to_string(),
            stops: vec!["A".into(), "B".into(), "C".into(), "D".into()],
            seats: vec![
                seat("s1", SeatClass::Economy, "1A", 80_000),
                seat("s2", SeatClass::Economy, "1B", 80_000),
                seat("s3", SeatClass::Business, "1C", 150_000),
            ],
        }
    }

    fn harness() -> Harness {
        let clock = MockClock::at_test_epoch();
        let store = InMemoryInventoryStore::new();
        let cache = Arc::new(InMemoryCache::with_clock(Arc::new(clock.clone())));
        let bus = Arc::new(InMemoryEventBus::new());
        let multi = Arc::new(MultiLevelCache::new(
            cache.clone(),
            Arc::new(clock.clone()),
            CacheConfig::default(),
        ));
        let config = InventoryConfig {
            store_retry: RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(1))
                .build(),
            ..InventoryConfig::default()
        };
        let engine = InventoryEngine::new(
            Arc::new(store.clone()),
            multi,
            Arc::new(clock.clone()),
            config,
        )
        .with_events(SeatEventPublisher::new(bus.clone()));
        Harness {
            engine,
            store,
            cache,
            bus,
            clock,
        }
    }

    fn hold_request(user: &str, from: &str, to: &str, seats: &[&str]) -> HoldRequest {
        HoldRequest {
            org_id: "org".to_string(),
            trip_id: "t1".to_string(),
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

    fn passenger(name: &str, seat: &str) -> BookingPassenger {
        BookingPassenger {
            name: name.to_string(),
            identity_document: "1234567890".to_string(),
            seat_id: seat.to_string(),
        }
    }

    /// Let spawned pre-lock releases run.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    async fn initialized() -> Harness {
        let h = harness();
        h.engine.initialize_trip(&manifest(), Deadline::none()).await.unwrap();
        h
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let h = harness();
        let first = h.engine.initialize_trip(&manifest(), Deadline::none()).await.unwrap();
        assert!(first.created);
        assert_eq!(first.row_count, 9);

        let second = h.engine.initialize_trip(&manifest(), Deadline::none()).await.unwrap();
        assert!(!second.created);
        assert_eq!(h.store.row_count("org", "t1"), 9);
    }

    #[tokio::test]
    async fn test_initialize_rejects_duplicate_seats() {
        let h = harness();
        let mut bad = manifest();
        bad.seats.push(bad.seats[0].clone());
        assert!(matches!(
            h.engine.initialize_trip(&bad, Deadline::none()).await,
            Err(InventoryError::InvalidManifest(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_orders_by_class_then_number() {
        let h = initialized().await;
        let availability = h
            .engine
            .check_availability(
                &AvailabilityQuery {
                    org_id: "org".into(),
                    trip_id: "t1".into(),
                    from: "A".into(),
                    to: "D".into(),
                    quantity: 2,
                    class: None,
                },
                Deadline::none(),
            )
            .await
            .unwrap();

        let ids: Vec<_> = availability.seats.iter().map(|s| s.seat_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s1", "s2"]);
        assert!(availability.is_available);
        assert_eq!(availability.total_price_paisa, 230_000);
    }

    #[tokio::test]
    async fn test_availability_filters_class() {
        let h = initialized().await;
        let availability = h
            .engine
            .check_availability(
                &AvailabilityQuery {
                    org_id: "org".into(),
                    trip_id: "t1".into(),
                    from: "A".into(),
                    to: "B".into(),
                    quantity: 3,
                    class: Some(SeatClass::Economy),
                },
                Deadline::none(),
            )
            .await
            .unwrap();
        assert_eq!(availability.available_count, 2);
        assert!(!availability.is_available);
    }

    #[tokio::test]
    async fn test_hold_marks_every_journey_row() {
        let h = initialized().await;
        let granted = h
            .engine
            .hold_seats(hold_request("u1", "A", "C", &["s1"]), Deadline::none())
            .await
            .unwrap();

        for segment in 0..2 {
            assert!(matches!(
                h.store.row_state("org", "t1", segment, "s1"),
                Some(SeatState::Held { hold_id, .. }) if hold_id == granted.hold_id
            ));
        }
        assert_eq!(h.store.row_state("org", "t1", 2, "s1"), Some(SeatState::Available));
        assert_eq!(h.bus.published_on(topics::INVENTORY).len(), 1);
        assert!(h.cache.peek(&hold_key("org", granted.hold_id)).is_some());
    }

    #[tokio::test]
    async fn test_hold_is_all_or_nothing() {
        let h = initialized().await;
        h.engine
            .hold_seats(hold_request("u1", "B", "C", &["s2"]), Deadline::none())
            .await
            .unwrap();

        let err = h
            .engine
            .hold_seats(hold_request("u2", "A", "D", &["s1", "s2"]), Deadline::none())
            .await
            .unwrap_err();
        let InventoryError::NotAvailable { conflicts } = err else {
            unreachable!("expected NotAvailable, got {err:?}");
        };
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].seat_id, "s2");
        assert_eq!(conflicts[0].segment_index, 1);
        for segment in 0..3 {
            assert_eq!(h.store.row_state("org", "t1", segment, "s1"), Some(SeatState::Available));
        }
    }

    #[tokio::test]
    async fn test_too_many_holds() {
        let h = initialized().await;
        for seat in ["s1", "s2"] {
            h.engine
                .hold_seats(hold_request("u1", "A", "B", &[seat]), Deadline::none())
                .await
                .unwrap();
        }
        assert!(matches!(
            h.engine
                .hold_seats(hold_request("u1", "A", "B", &["s3"]), Deadline::none())
                .await,
            Err(InventoryError::TooManyHolds { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_identity_document_limit_blocks_second_trip_hold() {
        let h = initialized().await;
        let mut first = hold_request("u1", "A", "B", &["s1"]);
        first.identity_documents = vec!["1234567890".into()];
        h.engine.hold_seats(first, Deadline::none()).await.unwrap();

        let mut second = hold_request("u2", "C", "D", &["s1"]);
        second.identity_documents = vec!["1234567890".into()];
        assert!(matches!(
            h.engine.hold_seats(second, Deadline::none()).await,
            Err(InventoryError::TicketLimit("nid_limit"))
        ));
    }

    #[tokio::test]
    async fn test_contended_prelock_fails_fast() {
        let h = initialized().await;
        let key = PreLocks::key("org", "t1", 0, "s1");
        h.cache.set_nx(&key, "other", Duration::from_secs(10)).await.unwrap();

        assert!(matches!(
            h.engine
                .hold_seats(hold_request("u1", "A", "B", &["s1"]), Deadline::none())
                .await,
            Err(InventoryError::Contention)
        ));
        assert_eq!(h.store.row_state("org", "t1", 0, "s1"), Some(SeatState::Available));
    }

    #[tokio::test]
    async fn test_cache_outage_does_not_block_holds() {
        let h = initialized().await;
        h.cache.set_unavailable(true);
        let granted = h
            .engine
            .hold_seats(hold_request("u1", "A", "B", &["s1"]), Deadline::none())
            .await
            .unwrap();
        h.engine
            .release_seats("org", granted.hold_id, "u1", Deadline::none())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_round_trip() {
        let h = initialized().await;
        let granted = h
            .engine
            .hold_seats(hold_request("u1", "A", "D", &["s1"]), Deadline::none())
            .await
            .unwrap();

        assert!(matches!(
            h.engine.release_seats("org", granted.hold_id, "u2", Deadline::none()).await,
            Err(InventoryError::NotOwner(_))
        ));
        let released = h
            .engine
            .release_seats("org", granted.hold_id, "u1", Deadline::none())
            .await
            .unwrap();
        assert_eq!(released.released_rows, 3);
        assert!(matches!(
            h.engine.release_seats("org", granted.hold_id, "u1", Deadline::none()).await,
            Err(InventoryError::HoldNotFound(_))
        ));
        settle().await;

        h.engine
            .hold_seats(hold_request("u2", "A", "D", &["s1"]), Deadline::none())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_confirm_then_cancel_returns_seats() {
        let h = initialized().await;
        let granted = h
            .engine
            .hold_seats(hold_request("u1", "A", "C", &["s1", "s2"]), Deadline::none())
            .await
            .unwrap();

        let confirmed = h
            .engine
            .confirm_booking(
                ConfirmRequest {
                    org_id: "org".into(),
                    hold_id: granted.hold_id,
                    order_id: "order-1".into(),
                    user_id: "u1".into(),
                    passengers: vec![passenger("Rahim", "s2"), passenger("Karim", "")],
                },
                Deadline::none(),
            )
            .await
            .unwrap();
        assert_eq!(confirmed.tickets.len(), 2);
        assert!(matches!(
            h.store.row_state("org", "t1", 1, "s2"),
            Some(SeatState::Booked { booking_id }) if booking_id == confirmed.booking_id
        ));

        let cancelled = h
            .engine
            .cancel_booking("org", confirmed.booking_id, Deadline::none())
            .await
            .unwrap();
        assert_eq!(cancelled.released_rows, 4);
        assert_eq!(h.store.row_state("org", "t1", 1, "s2"), Some(SeatState::Available));

        let again = h
            .engine
            .cancel_booking("org", confirmed.booking_id, Deadline::none())
            .await
            .unwrap();
        assert!(again.already_cancelled);
    }

    #[tokio::test]
    async fn test_confirm_checks_passenger_count() {
        let h = initialized().await;
        let granted = h
            .engine
            .hold_seats(hold_request("u1", "A", "B", &["s1", "s2"]), Deadline::none())
            .await
            .unwrap();
        assert!(matches!(
            h.engine
                .confirm_booking(
                    ConfirmRequest {
                        org_id: "org".into(),
                        hold_id: granted.hold_id,
                        order_id: "order-1".into(),
                        user_id: "u1".into(),
                        passengers: vec![passenger("Rahim", "s1")],
                    },
                    Deadline::none(),
                )
                .await,
            Err(InventoryError::CountMismatch { seats: 2, passengers: 1 })
        ));
    }

    #[tokio::test]
    async fn test_hold_at_exact_expiry_is_expired() {
        let h = initialized().await;
        let mut request = hold_request("u1", "A", "B", &["s1"]);
        request.ttl = Some(Duration::from_secs(60));
        let granted = h.engine.hold_seats(request, Deadline::none()).await.unwrap();

        h.clock.advance(chrono::Duration::seconds(60));
        assert!(matches!(
            h.engine
                .confirm_booking(
                    ConfirmRequest {
                        org_id: "org".into(),
                        hold_id: granted.hold_id,
                        order_id: "order-1".into(),
                        user_id: "u1".into(),
                        passengers: vec![passenger("Rahim", "s1")],
                    },
                    Deadline::none(),
                )
                .await,
            Err(InventoryError::HoldExpired(_))
        ));
        assert_eq!(h.store.row_state("org", "t1", 0, "s1"), Some(SeatState::Available));
    }

    #[tokio::test]
    async fn test_sweeper_reaps_expired_holds() {
        let h = initialized().await;
        let mut request = hold_request("u1", "A", "D", &["s1"]);
        request.ttl = Some(Duration::from_secs(1));
        h.engine.hold_seats(request, Deadline::none()).await.unwrap();

        h.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(h.engine.sweep_expired(100).await.unwrap(), 1);
        assert_eq!(h.store.row_state("org", "t1", 2, "s1"), Some(SeatState::Available));
        assert_eq!(h.engine.sweep_expired(100).await.unwrap(), 0);

        let released = h
            .bus
            .published_on(topics::INVENTORY)
            .into_iter()
            .filter(|e| e.event_type == event_types::SEATS_RELEASED)
            .count();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn test_lapsed_hold_gives_back_tallies_after_rows_are_retaken() {
        let h = initialized().await;
        let mut lapsing = hold_request("u1", "A", "D", &["s1"]);
        lapsing.ttl = Some(Duration::from_secs(1));
        lapsing.identity_documents = vec!["1111111111".into()];
        h.engine.hold_seats(lapsing, Deadline::none()).await.unwrap();
        settle().await;

        h.clock.advance(chrono::Duration::seconds(2));
        let newer = h
            .engine
            .hold_seats(hold_request("u2", "A", "D", &["s1"]), Deadline::none())
            .await
            .unwrap();

        assert_eq!(h.engine.sweep_expired(100).await.unwrap(), 1);
        assert!(matches!(
            h.store.row_state("org", "t1", 0, "s1"),
            Some(SeatState::Held { hold_id, .. }) if hold_id == newer.hold_id
        ));

        let mut again = hold_request("u1", "A", "D", &["s2"]);
        again.identity_documents = vec!["1111111111".into()];
        h.engine.hold_seats(again, Deadline::none()).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_refused_while_held() {
        let h = initialized().await;
        h.engine
            .hold_seats(hold_request("u1", "A", "B", &["s1"]), Deadline::none())
            .await
            .unwrap();
        assert!(matches!(
            h.engine.set_seat_blocked("org", "t1", "s1", true, Deadline::none()).await,
            Err(InventoryError::SeatBusy(_))
        ));

        h.engine
            .set_seat_blocked("org", "t1", "s2", true, Deadline::none())
            .await
            .unwrap();
        assert_eq!(h.store.row_state("org", "t1", 1, "s2"), Some(SeatState::Blocked));
    }

    #[tokio::test]
    async fn test_seat_map_reads_through_cache() {
        let h = initialized().await;
        let map = h
            .engine
            .get_seat_map("org", "t1", "A", "D", Deadline::none())
            .await
            .unwrap();
        assert_eq!(map.available_count, 3);
        assert!(h.cache.peek(&seat_map_key("org", "t1")).is_some());
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let h = initialized().await;
        h.store.set_unavailable(true);
        let err = h
            .engine
            .hold_seats(hold_request("u1", "A", "B", &["s1"]), Deadline::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_store_hiccup_is_retried() {
        let h = initialized().await;
        h.store.fail_next(1);
        h.engine
            .hold_seats(hold_request("u1", "A", "B", &["s1"]), Deadline::none())
            .await
            .unwrap();
    }

    #[test]
    fn test_passengers_keep_named_seats() {
        let seats = vec!["s1".to_string(), "s2".to_string()];
        let assigned = seat_passengers(&seats, vec![passenger("a", ""), passenger("b", "s1")]);
        assert_eq!(assigned[0].seat_id, "s2");
        assert_eq!(assigned[1].seat_id, "s1");
    }
}
