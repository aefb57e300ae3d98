//! Seat-segment inventory: types and the authoritative store contract.
//!
//! The primary state table is `(trip_id, segment_index, seat_id) → SeatState`.
//! Every transition on it is a compare-and-swap performed by the store; the
//! engine above composes those swaps into all-or-nothing holds.
//!
//! ```text
//!   AVAILABLE ──hold──► HELD ──confirm──► BOOKED
//!       ▲                │                  │
//!       ├──release◄──────┘                  │
//!       ├──expiry sweep◄─(HELD, expired)    │
//!       └──cancel-booking◄──────────────────┘
//!                  BLOCKED (admin-only)
//! ```

use crate::error::{Classify, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Seat class. Declaration order is the display priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatClass {
    /// First class
    First,
    /// Business class
    Business,
    /// Sleeper berth
    Sleeper,
    /// Economy class
    Economy,
}

impl SeatClass {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Business => "business",
            Self::Sleeper => "sleeper",
            Self::Economy => "economy",
        }
    }
}

impl fmt::Display for SeatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical seat position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatType {
    /// Window seat
    Window,
    /// Aisle seat
    Aisle,
    /// Middle seat
    Middle,
}

/// One seat of a trip's manifest. Price is segment independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatSpec {
    /// Stable seat identifier.
    pub seat_id: String,
    /// Display number, e.g. `A1`.
    pub number: String,
    /// Row used to group the seat map.
    pub row: u32,
    /// Seat class.
    pub class: SeatClass,
    /// Window / aisle / middle.
    pub seat_type: SeatType,
    /// Base price in minor currency units.
    pub price_paisa: i64,
    /// Initialise the seat as BLOCKED.
    #[serde(default)]
    pub blocked: bool,
}

/// A trip's stops and seat manifest. Immutable after initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripManifest {
    /// Owning organization.
    pub org_id: String,
    /// Trip identifier, assigned by the catalogue.
    pub trip_id: String,
    /// Ordered stop (station) identifiers `[S0..Sn]`.
    pub stops: Vec<String>,
    /// Seats offered on every segment.
    pub seats: Vec<SeatSpec>,
}

impl TripManifest {
    /// Number of segments (`stops - 1`, never negative).
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        u32::try_from(self.stops.len().saturating_sub(1)).unwrap_or(u32::MAX)
    }

    /// Looks up a seat by id.
    #[must_use]
    pub fn seat(&self, seat_id: &str) -> Option<&SeatSpec> {
        self.seats.iter().find(|s| s.seat_id == seat_id)
    }
}

/// Half-open run of segment indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRange {
    /// First segment index (inclusive).
    pub start: u32,
    /// Last segment index (exclusive).
    pub end: u32,
}

impl SegmentRange {
    /// Builds a range. Callers guarantee `start < end`.
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of segments covered.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// True when no segment is covered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when `segment` lies in the range.
    #[must_use]
    pub const fn contains(&self, segment: u32) -> bool {
        segment >= self.start && segment < self.end
    }

    /// Iterates the segment indices.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..self.end
    }
}

/// State of one seat-segment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatState {
    /// Free.
    Available,
    /// Reserved by a hold until `expires_at`.
    Held {
        /// Owning hold.
        hold_id: Uuid,
        /// Hold owner.
        user_id: String,
        /// Expiry; at or after this instant the row reads as available.
        expires_at: DateTime<Utc>,
    },
    /// Sold.
    Booked {
        /// Owning booking.
        booking_id: Uuid,
    },
    /// Withdrawn by an administrator.
    Blocked,
}

impl SeatState {
    /// True if a hold may claim this row at `now`.
    ///
    /// A HELD row whose expiry has been reached counts as available.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Available => true,
            Self::Held { expires_at, .. } => *expires_at <= now,
            Self::Booked { .. } | Self::Blocked => false,
        }
    }

    /// The view of this row at `now`, with expired holds read as available.
    #[must_use]
    pub fn effective(&self, now: DateTime<Utc>) -> Self {
        match self {
            Self::Held { expires_at, .. } if *expires_at <= now => Self::Available,
            other => other.clone(),
        }
    }

    /// Stable uppercase label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Held { .. } => "HELD",
            Self::Booked { .. } => "BOOKED",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// A `(trip, segment, seat)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatSegmentRow {
    /// Trip.
    pub trip_id: String,
    /// Segment index.
    pub segment_index: u32,
    /// Seat.
    pub seat_id: String,
    /// Current state.
    pub state: SeatState,
}

/// What a row must carry once claimed by a hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldClaim {
    /// Claiming hold.
    pub hold_id: Uuid,
    /// Hold owner.
    pub user_id: String,
    /// Hold expiry.
    pub expires_at: DateTime<Utc>,
}

/// Lifecycle of a [`SeatHold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    /// Seats are reserved.
    Active,
    /// Released by the owner or by compensation.
    Released,
    /// Turned into a booking.
    Converted,
    /// Lapsed by wall clock.
    Expired,
}

impl HoldStatus {
    /// Lowercase storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Converted => "converted",
            Self::Expired => "expired",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "released" => Some(Self::Released),
            "converted" => Some(Self::Converted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A scoped, time-bounded intent to purchase seats on a journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatHold {
    /// Globally unique hold id.
    pub hold_id: Uuid,
    /// Owning organization.
    pub org_id: String,
    /// Trip.
    pub trip_id: String,
    /// Owner.
    pub user_id: String,
    /// Client session that created the hold.
    pub session_id: String,
    /// Boarding stop.
    pub from_station: String,
    /// Alighting stop.
    pub to_station: String,
    /// Held seats, ascending.
    pub seat_ids: Vec<String>,
    /// Segments covered.
    pub segments: SegmentRange,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry; the hold is dead at and after this instant.
    pub expires_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: HoldStatus,
    /// Originating IP, for tally release.
    pub client_ip: Option<String>,
    /// Identity documents counted against tallies.
    pub identity_documents: Vec<String>,
}

impl SeatHold {
    /// ACTIVE and strictly before expiry.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Active && now < self.expires_at
    }
}

/// Lifecycle of a [`Booking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Seats are sold.
    Confirmed,
    /// Seats returned to inventory.
    Cancelled,
    /// Journey completed.
    Completed,
}

impl BookingStatus {
    /// Lowercase storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A passenger bound to a seat at confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPassenger {
    /// Passenger name.
    pub name: String,
    /// Identity document number.
    pub identity_document: String,
    /// Seat assigned.
    pub seat_id: String,
}

/// Ticket issued per seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatTicket {
    /// Seat.
    pub seat_id: String,
    /// Ticket id.
    pub ticket_id: Uuid,
}

/// A realized hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Globally unique booking id.
    pub booking_id: Uuid,
    /// The hold it was converted from.
    pub hold_id: Uuid,
    /// The order that paid for it.
    pub order_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Trip.
    pub trip_id: String,
    /// Owner.
    pub user_id: String,
    /// Booked seats.
    pub seat_ids: Vec<String>,
    /// Segments covered.
    pub segments: SegmentRange,
    /// Passengers in seat order.
    pub passengers: Vec<BookingPassenger>,
    /// One ticket per seat.
    pub tickets: Vec<SeatTicket>,
    /// Lifecycle status.
    pub status: BookingStatus,
    /// Confirmation time.
    pub created_at: DateTime<Utc>,
    /// Originating IP, carried over from the hold.
    pub client_ip: Option<String>,
    /// Identity documents, carried over from the hold.
    pub identity_documents: Vec<String>,
}

/// Errors from the authoritative inventory store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable, timed out or returned a server error.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row violates an expected shape.
    #[error("Data invariant violated: {0}")]
    Invariant(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Transient,
            Self::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

/// Boxed future returned by [`InventoryStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Authoritative seat-segment store.
///
/// Every row mutation is a conditional update; none of these methods trust
/// any lock held outside the store.
pub trait InventoryStore: Send + Sync {
    /// Write the manifest and every `(segment, seat)` row. Returns false if the
    /// trip already existed, in which case nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn initialize_trip<'a>(&'a self, manifest: &'a TripManifest) -> StoreFuture<'a, bool>;

    /// Load a trip's manifest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn trip<'a>(&'a self, org_id: &'a str, trip_id: &'a str)
    -> StoreFuture<'a, Option<TripManifest>>;

    /// All rows of a trip within `segments`, ordered by segment then seat.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        segments: SegmentRange,
    ) -> StoreFuture<'a, Vec<SeatSegmentRow>>;

    /// CAS one row to `HELD{claim}` iff it is AVAILABLE, expired-HELD, or already
    /// held by `claim.hold_id`. Returns true on success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn claim_row<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        segment_index: u32,
        seat_id: &'a str,
        claim: &'a HoldClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// CAS every row `HELD{hold_id}` back to AVAILABLE. Returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn release_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        hold_id: Uuid,
    ) -> StoreFuture<'a, u64>;

    /// Atomically move every `HELD{hold_id}` row to `BOOKED{booking_id}`, but only
    /// if exactly `expected_rows` rows are held by the hold. Returns false (and
    /// changes nothing) otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn convert_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        hold_id: Uuid,
        booking_id: Uuid,
        expected_rows: u64,
    ) -> StoreFuture<'a, bool>;

    /// CAS every row `BOOKED{booking_id}` back to AVAILABLE. Returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn cancel_rows<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        booking_id: Uuid,
    ) -> StoreFuture<'a, u64>;

    /// Move a seat between AVAILABLE and BLOCKED on every segment. Returns false
    /// (and changes nothing) if any row is held by a live hold or booked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn set_blocked<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        seat_id: &'a str,
        blocked: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Persist a new hold record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn insert_hold<'a>(&'a self, hold: &'a SeatHold) -> StoreFuture<'a, ()>;

    /// Load a hold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn hold(&self, hold_id: Uuid) -> StoreFuture<'_, Option<SeatHold>>;

    /// CAS a hold's status. Returns true if the hold was in `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn transition_hold(
        &self,
        hold_id: Uuid,
        from: HoldStatus,
        to: HoldStatus,
    ) -> StoreFuture<'_, bool>;

    /// Number of ACTIVE, unexpired holds owned by `user_id` in `org_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn count_live_holds<'a>(
        &'a self,
        org_id: &'a str,
        user_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, u64>;

    /// Up to `limit` ACTIVE holds whose expiry is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn expired_holds(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<SeatHold>>;

    /// Persist a new booking record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn insert_booking<'a>(&'a self, booking: &'a Booking) -> StoreFuture<'a, ()>;

    /// Load a booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn booking(&self, booking_id: Uuid) -> StoreFuture<'_, Option<Booking>>;

    /// CAS a booking's status. Returns true if the booking was in `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreFuture<'_, bool>;
}
