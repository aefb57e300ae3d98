//! Segment-based seat inventory.
//!
//! A trip with stops `[S0..Sn]` has `n` segments; every seat has one row per
//! segment. A journey needs the contiguous segments between its stops, and a
//! seat is sellable for the journey only if it is free on all of them.
//!
//! ```text
//!   AVAILABLE ──hold──► HELD ──confirm──► BOOKED
//!       ▲                │                  │
//!       ├──release◄──────┘                  │
//!       ├──expiry sweep◄─(HELD, expired)    │
//!       └──cancel-booking◄──────────────────┘
//!                  BLOCKED (admin only)
//! ```
//!
//! # Contention
//!
//! [`InventoryEngine::hold_seats`] takes advisory pre-locks in the shared cache
//! and then moves every required row with a per-row compare-and-swap in the
//! authoritative store. A hold is granted only if every CAS wins; otherwise the
//! rows this attempt took are released again, keyed on its `hold_id`.

mod engine;
mod events;
mod prelock;
mod seat_map;
mod segments;
mod sweeper;
mod tallies;

pub use engine::{
    Availability, AvailabilityQuery, AvailableSeat, CancelledBooking, ConfirmRequest,
    ConfirmedBooking, HoldGranted, HoldRequest, InitializedTrip, InventoryConfig,
    InventoryEngine, ReleasedHold,
};
pub use events::{SeatEventPublisher, SeatStatusChanged};
pub use prelock::{PreLockOutcome, PreLocks};
pub use seat_map::{CellStatus, LegendEntry, SeatCell, SeatMap, SeatMapRow};
pub use segments::derive_segments;
pub use sweeper::HoldSweeper;
pub use tallies::{TallyOutcome, TallySubject, TicketLimits, TicketTallies};

use seatline_core::error::{Classify, ErrorKind};
use seatline_core::inventory::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;
use uuid::Uuid;

/// A row that stopped a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatConflict {
    /// Seat.
    pub seat_id: String,
    /// Segment on which the seat is taken.
    pub segment_index: u32,
    /// Row status found there.
    pub status: String,
}

/// Inventory engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// A station is not on the trip, or `from` is not before `to`.
    #[error("invalid station range: {from} -> {to}")]
    InvalidRange {
        /// Boarding stop.
        from: String,
        /// Alighting stop.
        to: String,
    },

    /// A trip manifest was rejected.
    #[error("invalid trip manifest: {0}")]
    InvalidManifest(String),

    /// The request named no seats.
    #[error("no seats requested")]
    EmptySelection,

    /// The trip has no inventory.
    #[error("trip {0} not found")]
    TripNotFound(String),

    /// A requested seat is not on the trip.
    #[error("seat {0} is not on this trip")]
    UnknownSeat(String),

    /// The user already has the maximum number of live holds.
    #[error("maximum concurrent holds exceeded (limit {limit})")]
    TooManyHolds {
        /// The limit.
        limit: u64,
    },

    /// An anti-scalping budget would be exceeded.
    #[error("ticket limit reached: {0}")]
    TicketLimit(&'static str),

    /// Another caller is mutating the same rows right now.
    #[error("seat query contention - please retry")]
    Contention,

    /// At least one seat is taken on the journey.
    #[error("{}", describe_conflicts(.conflicts))]
    NotAvailable {
        /// Every blocking row found.
        conflicts: Vec<SeatConflict>,
    },

    /// No hold with this id in the organisation.
    #[error("hold {0} not found")]
    HoldNotFound(Uuid),

    /// The hold belongs to another user.
    #[error("hold {0} not found for this user")]
    NotOwner(Uuid),

    /// The hold is no longer active.
    #[error("hold {0} has expired")]
    HoldExpired(Uuid),

    /// Passengers and seats differ in number.
    #[error("passenger count {passengers} does not match seat count {seats}")]
    CountMismatch {
        /// Seats on the hold.
        seats: usize,
        /// Passengers supplied.
        passengers: usize,
    },

    /// No booking with this id in the organisation.
    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    /// A seat cannot be blocked or unblocked while held or booked.
    #[error("seat {0} is held or booked")]
    SeatBusy(String),

    /// The operation's deadline passed.
    #[error("inventory operation timed out")]
    Timeout,

    /// The authoritative store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for InventoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRange { .. }
            | Self::InvalidManifest(_)
            | Self::EmptySelection
            | Self::UnknownSeat(_)
            | Self::HoldExpired(_)
            | Self::CountMismatch { .. } => ErrorKind::Precondition,
            Self::TripNotFound(_)
            | Self::HoldNotFound(_)
            | Self::NotOwner(_)
            | Self::BookingNotFound(_) => ErrorKind::NotFound,
            Self::TooManyHolds { .. }
            | Self::TicketLimit(_)
            | Self::Contention
            | Self::NotAvailable { .. }
            | Self::SeatBusy(_) => ErrorKind::Conflict,
            Self::Timeout => ErrorKind::Transient,
            Self::Store(e) => e.kind(),
        }
    }
}

fn describe_conflicts(conflicts: &[SeatConflict]) -> String {
    let mut out = String::from("some seats not available:");
    for (i, c) in conflicts.iter().enumerate() {
        let sep = if i == 0 { " " } else { ", " };
        let _ = write!(
            out,
            "{sep}seat {} {} on segment {}",
            c.seat_id, c.status, c.segment_index
        );
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_rows() {
        let err = InventoryError::NotAvailable {
            conflicts: vec![SeatConflict {
                seat_id: "s1".to_string(),
                segment_index: 1,
                status: "HELD".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "some seats not available: seat s1 HELD on segment 1");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            InventoryError::InvalidRange {
                from: "B".into(),
                to: "B".into()
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(InventoryError::NotOwner(Uuid::nil()).kind(), ErrorKind::NotFound);
        assert_eq!(InventoryError::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(
            InventoryError::Store(StoreError::Unavailable("down".into())).kind(),
            ErrorKind::Transient
        );
    }
}
