//! In-memory authoritative inventory.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use seatline_core::inventory::{
    Booking, BookingStatus, HoldClaim, HoldStatus, InventoryStore, SeatHold, SeatSegmentRow,
    SeatState, SegmentRange, StoreError, StoreFuture, TripManifest,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

type TripKey = (String, String);

#[derive(Default)]
struct State {
    trips: HashMap<TripKey, TripManifest>,
    rows: HashMap<TripKey, BTreeMap<(u32, String), SeatState>>,
    holds: HashMap<Uuid, SeatHold>,
    bookings: HashMap<Uuid, Booking>,
}

/// [`InventoryStore`] over one mutex; every row CAS is linearizable.
#[derive(Clone, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
}

impl InMemoryInventoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Current stored state of a row, without expiry applied.
    #[must_use]
    pub fn row_state(
        &self,
        org_id: &str,
        trip_id: &str,
        segment_index: u32,
        seat_id: &str,
    ) -> Option<SeatState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .get(&key(org_id, trip_id))
            .and_then(|rows| rows.get(&(segment_index, seat_id.to_string())))
            .cloned()
    }

    /// Number of rows stored for a trip.
    #[must_use]
    pub fn row_count(&self, org_id: &str, trip_id: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .get(&key(org_id, trip_id))
            .map_or(0, BTreeMap::len)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }
}

fn key(org_id: &str, trip_id: &str) -> TripKey {
    (org_id.to_string(), trip_id.to_string())
}

impl InventoryStore for InMemoryInventoryStore {
    fn initialize_trip<'a>(&'a self, manifest: &'a TripManifest) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let trip_key = key(&manifest.org_id, &manifest.trip_id);
            if state.trips.contains_key(&trip_key) {
                return Ok(false);
            }

            let mut rows = BTreeMap::new();
            for segment in 0..manifest.segment_count() {
                for seat in &manifest.seats {
                    let initial = if seat.blocked {
                        SeatState::Blocked
                    } else {
                        SeatState::Available
                    };
                    rows.insert((segment, seat.seat_id.clone()), initial);
                }
            }
            state.rows.insert(trip_key.clone(), rows);
            state.trips.insert(trip_key, manifest.clone());
            Ok(true)
        })
    }

    fn trip<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
    ) -> StoreFuture<'a, Option<TripManifest>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).trips.get(&key(org_id, trip_id)).cloned())
        })
    }

    fn rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        segments: SegmentRange,
    ) -> StoreFuture<'a, Vec<SeatSegmentRow>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(rows) = state.rows.get(&key(org_id, trip_id)) else {
                return Ok(Vec::new());
            };
            Ok(rows
                .iter()
                .filter(|((segment, _), _)| segments.contains(*segment))
                .map(|((segment, seat), row)| SeatSegmentRow {
                    trip_id: trip_id.to_string(),
                    segment_index: *segment,
                    seat_id: seat.clone(),
                    state: row.clone(),
                })
                .collect())
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
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(row) = state
                .rows
                .get_mut(&key(org_id, trip_id))
                .and_then(|rows| rows.get_mut(&(segment_index, seat_id.to_string())))
            else {
                return Ok(false);
            };

            let own = matches!(row, SeatState::Held { hold_id, .. } if *hold_id == claim.hold_id);
            if !own && !row.is_claimable(now) {
                return Ok(false);
            }
            *row = SeatState::Held {
                hold_id: claim.hold_id,
                user_id: claim.user_id.clone(),
                expires_at: claim.expires_at,
            };
            Ok(true)
        })
    }

    fn release_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        hold_id: Uuid,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut released = 0;
            if let Some(rows) = state.rows.get_mut(&key(org_id, trip_id)) {
                for row in rows.values_mut() {
                    if matches!(row, SeatState::Held { hold_id: h, .. } if *h == hold_id) {
                        *row = SeatState::Available;
                        released += 1;
                    }
                }
            }
            Ok(released)
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
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(rows) = state.rows.get_mut(&key(org_id, trip_id)) else {
                return Ok(false);
            };
            let held = |row: &SeatState| {
                matches!(row, SeatState::Held { hold_id: h, .. } if *h == hold_id)
            };
            let count = rows.values().filter(|row| held(row)).count() as u64;
            if count != expected_rows {
                return Ok(false);
            }
            for row in rows.values_mut().filter(|row| held(row)) {
                *row = SeatState::Booked { booking_id };
            }
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
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut cancelled = 0;
            if let Some(rows) = state.rows.get_mut(&key(org_id, trip_id)) {
                for row in rows.values_mut() {
                    if matches!(row, SeatState::Booked { booking_id: b } if *b == booking_id) {
                        *row = SeatState::Available;
                        cancelled += 1;
                    }
                }
            }
            Ok(cancelled)
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
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(rows) = state.rows.get_mut(&key(org_id, trip_id)) else {
                return Ok(false);
            };

            let seat_rows: Vec<_> = rows
                .iter()
                .filter(|((_, seat), _)| seat == seat_id)
                .map(|(k, _)| k.clone())
                .collect();
            if seat_rows.is_empty() {
                return Ok(false);
            }

            let movable = seat_rows.iter().all(|k| {
                let row = &rows[k];
                if blocked {
                    row.is_claimable(now) || *row == SeatState::Blocked
                } else {
                    matches!(row, SeatState::Blocked | SeatState::Available)
                }
            });
            if !movable {
                return Ok(false);
            }

            for k in seat_rows {
                if let Some(row) = rows.get_mut(&k) {
                    *row = if blocked {
                        SeatState::Blocked
                    } else {
                        SeatState::Available
                    };
                }
            }
            Ok(true)
        })
    }

    fn insert_hold<'a>(&'a self, hold: &'a SeatHold) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .holds
                .insert(hold.hold_id, hold.clone());
            Ok(())
        })
    }

    fn hold(&self, hold_id: Uuid) -> StoreFuture<'_, Option<SeatHold>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).holds.get(&hold_id).cloned())
        })
    }

    fn transition_hold(
        &self,
        hold_id: Uuid,
        from: HoldStatus,
        to: HoldStatus,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.holds.get_mut(&hold_id) {
                Some(hold) if hold.status == from => {
                    hold.status = to;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn count_live_holds<'a>(
        &'a self,
        org_id: &'a str,
        user_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(state
                .holds
                .values()
                .filter(|h| h.org_id == org_id && h.user_id == user_id && h.is_live(now))
                .count() as u64)
        })
    }

    fn expired_holds(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<SeatHold>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut expired: Vec<SeatHold> = state
                .holds
                .values()
                .filter(|h| h.status == HoldStatus::Active && h.expires_at <= now)
                .cloned()
                .collect();
            expired.sort_by_key(|h| h.expires_at);
            expired.truncate(limit);
            Ok(expired)
        })
    }

    fn insert_booking<'a>(&'a self, booking: &'a Booking) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .bookings
                .insert(booking.booking_id, booking.clone());
            Ok(())
        })
    }

    fn booking(&self, booking_id: Uuid) -> StoreFuture<'_, Option<Booking>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).bookings.get(&booking_id).cloned())
        })
    }

    fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.bookings.get_mut(&booking_id) {
                Some(booking) if booking.status == from => {
                    booking.status = to;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}
