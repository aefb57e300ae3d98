//! Seat map rendering.
//!
//! The cached snapshot holds every row of every segment, so one entry serves
//! every journey on the trip. Rendering folds a seat's rows over the journey
//! into one status with precedence `BLOCKED > BOOKED > HELD > AVAILABLE`.

use chrono::{DateTime, Utc};
use seatline_core::inventory::{
    SeatClass, SeatSegmentRow, SeatState, SeatType, SegmentRange, TripManifest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Status of one seat over a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellStatus {
    /// Free on every segment.
    Available,
    /// Held on at least one segment.
    Held,
    /// Booked on at least one segment.
    Booked,
    /// Blocked by an administrator.
    Blocked,
}

impl CellStatus {
    fn from_state(state: &SeatState) -> Self {
        match state {
            SeatState::Available => Self::Available,
            SeatState::Held { .. } => Self::Held,
            SeatState::Booked { .. } => Self::Booked,
            SeatState::Blocked => Self::Blocked,
        }
    }

    /// Legend colour.
    #[must_use]
    pub const fn color(self) -> &'static str {
        match self {
            Self::Available => "#00FF00",
            Self::Held => "#FFFF00",
            Self::Booked => "#FF0000",
            Self::Blocked => "#808080",
        }
    }

    /// Legend label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Held => "Held",
            Self::Booked => "Booked",
            Self::Blocked => "Blocked",
        }
    }
}

/// One seat on the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatCell {
    /// Seat id.
    pub seat_id: String,
    /// Printed seat number.
    pub number: String,
    /// Fare class.
    pub class: SeatClass,
    /// Position.
    pub seat_type: SeatType,
    /// Fare in paisa.
    pub price_paisa: i64,
    /// Status over the journey.
    pub status: CellStatus,
}

/// Seats sharing a physical row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatMapRow {
    /// Row number.
    pub row: u32,
    /// Seats in the row, by seat number.
    pub seats: Vec<SeatCell>,
}

/// One legend entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegendEntry {
    /// Status.
    pub status: CellStatus,
    /// Display label.
    pub label: String,
    /// Hex colour.
    pub color: String,
}

/// Rendered availability of a trip over a journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatMap {
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
    /// Segments the journey covers.
    pub segments: SegmentRange,
    /// Rows in ascending order.
    pub rows: Vec<SeatMapRow>,
    /// Seats available on the whole journey.
    pub available_count: usize,
    /// Colour legend.
    pub legend: Vec<LegendEntry>,
    /// Render time.
    pub generated_at: DateTime<Utc>,
}

/// Render `snapshot` for the journey `from → to` covering `segments`.
///
/// A seat with no row on some journey segment is shown as blocked.
#[must_use]
pub fn render(
    manifest: &TripManifest,
    snapshot: &[SeatSegmentRow],
    from: &str,
    to: &str,
    segments: SegmentRange,
    now: DateTime<Utc>,
) -> SeatMap {
    let mut per_seat: HashMap<&str, (u32, CellStatus)> = HashMap::new();
    for row in snapshot.iter().filter(|r| segments.contains(r.segment_index)) {
        let status = CellStatus::from_state(&row.state.effective(now));
        let entry = per_seat
            .entry(row.seat_id.as_str())
            .or_insert((0, CellStatus::Available));
        entry.0 += 1;
        entry.1 = entry.1.max(status);
    }

    let mut rows: BTreeMap<u32, Vec<SeatCell>> = BTreeMap::new();
    let mut available_count = 0;
    for seat in &manifest.seats {
        let status = match per_seat.get(seat.seat_id.as_str()) {
            Some((covered, status)) if *covered == segments.len() => *status,
            _ => CellStatus::Blocked,
        };
        if status == CellStatus::Available {
            available_count += 1;
        }
        rows.entry(seat.row).or_default().push(SeatCell {
            seat_id: seat.seat_id.clone(),
            number: seat.number.clone(),
            class: seat.class,
            seat_type: seat.seat_type,
            price_paisa: seat.price_paisa,
            status,
        });
    }

    let rows = rows
        .into_iter()
        .map(|(row, mut seats)| {
            seats.sort_by(|a, b| a.number.cmp(&b.number));
            SeatMapRow { row, seats }
        })
        .collect();

    SeatMap {
        trip_id: manifest.trip_id.clone(),
        from: from.to_string(),
        to: to.to_string(),
        segments,
        rows,
        available_count,
        legend: legend(),
        generated_at: now,
    }
}

fn legend() -> Vec<LegendEntry> {
    [
        CellStatus::Available,
        CellStatus::Held,
        CellStatus::Booked,
        CellStatus::Blocked,
    ]
    .into_iter()
    .map(|status| LegendEntry {
        status,
        label: status.label().to_string(),
        color: status.color().to_string(),
    })
    .collect()
}
