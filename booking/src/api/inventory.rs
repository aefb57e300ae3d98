//! Seat inventory endpoints.
//!
//! - `POST /v1/inventory/trips` - materialise a trip's seat grid
//! - `GET /v1/inventory/trips/:trip_id/availability` - seats free on a journey
//! - `GET /v1/inventory/trips/:trip_id/seatmap` - rendered seat map
//! - `POST /v1/inventory/trips/:trip_id/seats/:seat_id/block` - block or unblock a seat
//! - `POST /v1/inventory/holds` - hold seats
//! - `DELETE /v1/inventory/holds/:hold_id` - release a hold
//! - `POST /v1/inventory/holds/:hold_id/confirm` - turn a hold into a booking
//! - `POST /v1/inventory/bookings/:booking_id/cancel` - cancel a booking

use super::{Caller, Organization};
use crate::inventory::{
    Availability, AvailabilityQuery, CancelledBooking, ConfirmRequest, ConfirmedBooking,
    HoldGranted, HoldRequest, InitializedTrip, ReleasedHold, SeatMap,
};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use seatline_core::inventory::{BookingPassenger, SeatClass, SeatSpec, TripManifest};
use seatline_web::{AppError, ClientIp, RequestDeadline, WebResult};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Body of `POST /v1/inventory/trips`.
#[derive(Debug, Deserialize)]
pub struct InitializeTripBody {
    /// Trip id from the catalogue.
    pub trip_id: String,
    /// Ordered stops.
    pub stops: Vec<String>,
    /// Seat manifest.
    pub seats: Vec<SeatSpec>,
}

/// Materialise a trip. 201 when written, 200 when it already existed.
pub async fn initialize_trip(
    State(state): State<AppState>,
    Organization(org_id): Organization,
    RequestDeadline(deadline): RequestDeadline,
    Json(body): Json<InitializeTripBody>,
) -> WebResult<(StatusCode, Json<InitializedTrip>)> {
    let manifest = TripManifest {
        org_id,
        trip_id: body.trip_id,
        stops: body.stops,
        seats: body.seats,
    };
    let trip = state
        .inventory
        .initialize_trip(&manifest, deadline)
        .await
        .map_err(|e| AppError::classified(&e))?;
    let status = if trip.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(trip)))
}

/// Query of the availability endpoint.
#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
    /// Seats wanted.
    #[serde(default = "one")]
    pub quantity: u32,
    /// Restrict to one class.
    pub class: Option<SeatClass>,
}

const fn one() -> u32 {
    1
}

/// Seats free on every segment of a journey.
pub async fn check_availability(
    State(state): State<AppState>,
    Organization(org_id): Organization,
    RequestDeadline(deadline): RequestDeadline,
    Path(trip_id): Path<String>,
    Query(params): Query<AvailabilityParams>,
) -> WebResult<Json<Availability>> {
    let query = AvailabilityQuery {
        org_id,
        trip_id,
        from: params.from,
        to: params.to,
        quantity: params.quantity,
        class: params.class,
    };
    state
        .inventory
        .check_availability(&query, deadline)
        .await
        .map(Json)
        .map_err(|e| AppError::classified(&e))
}

/// Query of the seat-map endpoint.
#[derive(Debug, Deserialize)]
pub struct JourneyParams {
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
}

/// Seat map of a journey.
pub async fn get_seat_map(
    State(state): State<AppState>,
    Organization(org_id): Organization,
    RequestDeadline(deadline): RequestDeadline,
    Path(trip_id): Path<String>,
    Query(params): Query<JourneyParams>,
) -> WebResult<Json<SeatMap>> {
    state
        .inventory
        .get_seat_map(&org_id, &trip_id, &params.from, &params.to, deadline)
        .await
        .map(Json)
        .map_err(|e| AppError::classified(&e))
}

/// Body of the block endpoint.
#[derive(Debug, Deserialize)]
pub struct BlockSeatBody {
    /// Block when true, unblock when false.
    pub blocked: bool,
}

/// Block or unblock a seat on every segment.
pub async fn set_seat_blocked(
    State(state): State<AppState>,
    Organization(org_id): Organization,
    RequestDeadline(deadline): RequestDeadline,
    Path((trip_id, seat_id)): Path<(String, String)>,
    Json(body): Json<BlockSeatBody>,
) -> WebResult<StatusCode> {
    state
        .inventory
        .set_seat_blocked(&org_id, &trip_id, &seat_id, body.blocked, deadline)
        .await
        .map_err(|e| AppError::classified(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of `POST /v1/inventory/holds`.
#[derive(Debug, Deserialize)]
pub struct HoldSeatsBody {
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from_station_id: String,
    /// Alighting stop.
    pub to_station_id: String,
    /// Seats wanted.
    pub seat_ids: Vec<String>,
    /// Buyer's session.
    #[serde(default)]
    pub session_id: String,
    /// Hold lifetime; the server default when absent.
    pub ttl_seconds: Option<u64>,
    /// One identity document per passenger.
    #[serde(default)]
    pub identity_documents: Vec<String>,
}

/// Hold seats for the caller.
pub async fn hold_seats(
    State(state): State<AppState>,
    caller: Caller,
    ClientIp(client_ip): ClientIp,
    RequestDeadline(deadline): RequestDeadline,
    Json(body): Json<HoldSeatsBody>,
) -> WebResult<(StatusCode, Json<HoldGranted>)> {
    let request = HoldRequest {
        org_id: caller.organization_id,
        trip_id: body.trip_id,
        from: body.from_station_id,
        to: body.to_station_id,
        seat_ids: body.seat_ids,
        user_id: caller.user_id,
        session_id: body.session_id,
        ttl: body.ttl_seconds.filter(|s| *s > 0).map(Duration::from_secs),
        client_ip: Some(client_ip.to_string()),
        identity_documents: body.identity_documents,
    };
    let hold = state
        .inventory
        .hold_seats(request, deadline)
        .await
        .map_err(|e| AppError::classified(&e))?;
    Ok((StatusCode::CREATED, Json(hold)))
}

/// Release one of the caller's holds.
pub async fn release_hold(
    State(state): State<AppState>,
    caller: Caller,
    RequestDeadline(deadline): RequestDeadline,
    Path(hold_id): Path<Uuid>,
) -> WebResult<Json<ReleasedHold>> {
    state
        .inventory
        .release_seats(&caller.organization_id, hold_id, &caller.user_id, deadline)
        .await
        .map(Json)
        .map_err(|e| AppError::classified(&e))
}

/// Body of the confirm endpoint.
#[derive(Debug, Deserialize)]
pub struct ConfirmHoldBody {
    /// Order paying for the seats.
    pub order_id: String,
    /// One passenger per held seat.
    pub passengers: Vec<BookingPassenger>,
}

/// Convert one of the caller's holds into a booking.
pub async fn confirm_hold(
    State(state): State<AppState>,
    caller: Caller,
    RequestDeadline(deadline): RequestDeadline,
    Path(hold_id): Path<Uuid>,
    Json(body): Json<ConfirmHoldBody>,
) -> WebResult<(StatusCode, Json<ConfirmedBooking>)> {
    let request = ConfirmRequest {
        org_id: caller.organization_id,
        hold_id,
        order_id: body.order_id,
        user_id: caller.user_id,
        passengers: body.passengers,
    };
    let booking = state
        .inventory
        .confirm_booking(request, deadline)
        .await
        .map_err(|e| AppError::classified(&e))?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// Cancel a booking of the organisation.
pub async fn cancel_booking(
    State(state): State<AppState>,
    Organization(org_id): Organization,
    RequestDeadline(deadline): RequestDeadline,
    Path(booking_id): Path<Uuid>,
) -> WebResult<Json<CancelledBooking>> {
    state
        .inventory
        .cancel_booking(&org_id, booking_id, deadline)
        .await
        .map(Json)
        .map_err(|e| AppError::classified(&e))
}
