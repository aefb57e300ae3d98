//! Property tests: no seat is ever sold twice, holds keep their rows while
//! live, and every saga ends in a terminal state with its rollback done.
//!
//! Run with: `cargo test --test invariants`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use chrono::{DateTime, Utc};
use common::{ORG, Stack, TRIP, hold_request, order_request, settle};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, join_all};
use proptest::prelude::*;
use seatline_booking::inventory::{AvailabilityQuery, ConfirmRequest, InventoryError};
use seatline_booking::saga::steps;
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::inventory::{BookingPassenger, SeatState};
use seatline_core::order::OrderStatus;
use seatline_core::saga::{SagaStatus, StepStatus};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const SEATS: [&str; 3] = ["s1", "s2", "s3"];
const STOPS: [&str; 4] = ["A", "B", "C", "D"];
const USERS: [&str; 4] = ["U0", "U1", "U2", "U3"];

#[derive(Debug, Clone)]
enum Op {
    Hold {
        user: usize,
        from: usize,
        len: usize,
        seats: Vec<usize>,
    },
    Release(usize),
    Confirm(usize),
    Cancel(usize),
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..USERS.len(), 0..3usize, 1..=3usize, proptest::sample::subsequence(vec![0usize, 1, 2], 1..=2))
            .prop_map(|(user, from, len, seats)| Op::Hold { user, from, len: len.min(3 - from), seats }),
        2 => any::<usize>().prop_map(Op::Release),
        2 => any::<usize>().prop_map(Op::Confirm),
        1 => any::<usize>().prop_map(Op::Cancel),
        1 => (0..900i64).prop_map(Op::Advance),
    ]
}

struct Claim {
    id: Uuid,
    user: String,
    seats: Vec<String>,
    from: usize,
    to: usize,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
}

enum Outcome {
    Held(Claim),
    Released(usize),
    Confirmed(usize, Uuid),
    Cancelled(usize),
    Rejected,
}

/// Every live hold and booking owns its rows, and no two own the same row.
fn check_ownership(stack: &Stack, holds: &[Claim], bookings: &[Claim]) {
    let now = stack.clock.now();
    let mut owners: HashMap<(usize, String), Uuid> = HashMap::new();

    let live_holds = holds
        .iter()
        .filter(|h| h.active && h.expires_at.is_some_and(|e| now < e));
    let live_bookings = bookings.iter().filter(|b| b.active);

    for claim in live_holds.chain(live_bookings) {
        for segment in claim.from..claim.to {
            for seat in &claim.seats {
                if let Some(other) = owners.insert((segment, seat.clone()), claim.id) {
                    panic!("{seat} on segment {segment} owned by {other} and {}", claim.id);
                }
                let index = u32::try_from(segment).unwrap();
                let state = stack.store.row_state(ORG, TRIP, index, seat);
                let owned = match state {
                    Some(SeatState::Held { hold_id, .. }) => hold_id == claim.id,
                    Some(SeatState::Booked { booking_id }) => booking_id == claim.id,
                    _ => false,
                };
                assert!(owned, "{seat} on segment {segment} is {state:?}, expected {}", claim.id);
            }
        }
    }
}

async fn run_batches(batches: Vec<Vec<Op>>) {
    let stack = Stack::with_trip(&SEATS).await;
    let mut holds: Vec<Claim> = Vec::new();
    let mut bookings: Vec<Claim> = Vec::new();

    for batch in batches {
        let mut used = HashSet::new();
        let mut pending: Vec<LocalBoxFuture<'_, Outcome>> = Vec::new();

        for op in batch {
            let release = matches!(op, Op::Release(_));
            match op {
                Op::Advance(secs) => stack.clock.advance(chrono::Duration::seconds(secs)),
                Op::Hold { user, from, len, seats } => {
                    let seat_ids: Vec<&str> = seats.iter().map(|i| SEATS[*i]).collect();
                    let request = hold_request(USERS[user], STOPS[from], STOPS[from + len], &seat_ids);
                    let engine = &stack.engine;
                    pending.push(
                        async move {
                            match engine.hold_seats(request, Deadline::none()).await {
                                Ok(granted) => Outcome::Held(Claim {
                                    id: granted.hold_id,
                                    user: USERS[user].to_string(),
                                    seats: granted.seat_ids,
                                    from,
                                    to: from + len,
                                    expires_at: Some(granted.expires_at),
                                    active: true,
                                }),
                                Err(_) => Outcome::Rejected,
                            }
                        }
                        .boxed_local(),
                    );
                }
                Op::Release(pick) | Op::Confirm(pick) if !holds.is_empty() => {
                    let index = pick % holds.len();
                    if !holds[index].active || !used.insert(("hold", index)) {
                        continue;
                    }
                    let hold = &holds[index];
                    let engine = &stack.engine;
                    if release {
                        pending.push(
                            async move {
                                match engine
                                    .release_seats(ORG, hold.id, &hold.user, Deadline::none())
                                    .await
                                {
                                    Ok(_) => Outcome::Released(index),
                                    Err(_) => Outcome::Rejected,
                                }
                            }
                            .boxed_local(),
                        );
                    } else {
                        let request = ConfirmRequest {
                            org_id: ORG.to_string(),
                            hold_id: hold.id,
                            order_id: format!("order-{index}"),
                            user_id: hold.user.clone(),
                            passengers: hold
                                .seats
                                .iter()
                                .enumerate()
                                .map(|(n, seat)| BookingPassenger {
                                    name: format!("Passenger {n}"),
                                    identity_document: format!("100000000{n}"),
                                    seat_id: seat.clone(),
                                })
                                .collect(),
                        };
                        pending.push(
                            async move {
                                match engine.confirm_booking(request, Deadline::none()).await {
                                    Ok(booking) => Outcome::Confirmed(index, booking.booking_id),
                                    Err(_) => Outcome::Rejected,
                                }
                            }
                            .boxed_local(),
                        );
                    }
                }
                Op::Cancel(pick) if !bookings.is_empty() => {
                    let index = pick % bookings.len();
                    if !bookings[index].active || !used.insert(("booking", index)) {
                        continue;
                    }
                    let booking_id = bookings[index].id;
                    let engine = &stack.engine;
                    pending.push(
                        async move {
                            match engine.cancel_booking(ORG, booking_id, Deadline::none()).await {
                                Ok(_) => Outcome::Cancelled(index),
                                Err(_) => Outcome::Rejected,
                            }
                        }
                        .boxed_local(),
                    );
                }
                Op::Release(_) | Op::Confirm(_) | Op::Cancel(_) => {}
            }
        }

        let outcomes = join_all(pending).await;
        settle().await;
        for outcome in outcomes {
            match outcome {
                Outcome::Held(claim) => holds.push(claim),
                Outcome::Released(index) => holds[index].active = false,
                Outcome::Confirmed(index, booking_id) => {
                    holds[index].active = false;
                    let hold = &holds[index];
                    bookings.push(Claim {
                        id: booking_id,
                        user: hold.user.clone(),
                        seats: hold.seats.clone(),
                        from: hold.from,
                        to: hold.to,
                        expires_at: None,
                        active: true,
                    });
                }
                Outcome::Cancelled(index) => bookings[index].active = false,
                Outcome::Rejected => {}
            }
        }

        check_ownership(&stack, &holds, &bookings);
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    None,
    UnknownIdentity,
    SeatTaken,
    Declined,
    CaptureRefused,
}

fn failure() -> impl Strategy<Value = Failure> {
    prop_oneof![
        Just(Failure::None),
        Just(Failure::UnknownIdentity),
        Just(Failure::SeatTaken),
        Just(Failure::Declined),
        Just(Failure::CaptureRefused),
    ]
}

async fn run_saga(failure: Failure, seat_count: usize) {
    let stack = Stack::with_trip(&SEATS).await;
    let seats = &SEATS[..seat_count];
    let mut request = order_request("buyer", "A", "D", seats);

    match failure {
        Failure::None => {}
        Failure::UnknownIdentity => request.passengers[0].nid = "0123456789".to_string(),
        Failure::SeatTaken => {
            stack
                .engine
                .hold_seats(hold_request("other", "B", "C", &[seats[0]]), Deadline::none())
                .await
                .expect("blocking hold");
            settle().await;
        }
        Failure::Declined => stack.sslcommerz.decline_next(1),
        Failure::CaptureRefused => stack.sslcommerz.fail_next_captures(1),
    }

    let (order, _) = stack
        .orders
        .place_order(request, Deadline::none())
        .await
        .expect("order placed");
    let settled = stack
        .orders
        .complete_booking(order.id, Deadline::none())
        .await
        .expect("saga ran");
    let record = stack
        .orchestrator
        .get(order.saga_id.expect("saga id"))
        .await
        .expect("saga record");

    assert!(record.status.is_terminal(), "status {:?}", record.status);
    assert!(
        record
            .steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Running | StepStatus::Compensating)),
        "steps {:?}",
        record.steps
    );

    let compensable = [steps::HOLD_SEATS, steps::CAPTURE_PAYMENT, steps::CONFIRM_BOOKING];
    if record.status == SagaStatus::Completed {
        assert!(matches!(failure, Failure::None));
        assert_eq!(settled.status, OrderStatus::Confirmed);
    } else {
        assert_eq!(settled.status, OrderStatus::Failed);
        for step in &record.steps {
            if compensable.contains(&step.name.as_str()) && step.status != StepStatus::Pending
                && step.status != StepStatus::Failed
            {
                assert!(step.compensated, "{} left uncompensated", step.name);
            }
        }
        for seat in seats.iter().skip(usize::from(matches!(failure, Failure::SeatTaken))) {
            for segment in 0..3 {
                assert_eq!(
                    stack.store.row_state(ORG, TRIP, segment, seat),
                    Some(SeatState::Available),
                    "{seat} segment {segment}"
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_no_row_is_owned_twice(batches in proptest::collection::vec(proptest::collection::vec(op(), 1..6), 1..12)) {
        tokio_test::block_on(run_batches(batches));
    }

    #[test]
    fn test_saga_ends_terminal_with_rollback_done(failure in failure(), seat_count in 1..=2usize) {
        tokio_test::block_on(run_saga(failure, seat_count));
    }

    #[test]
    fn test_reported_availability_can_be_held(
        prior in proptest::collection::vec((0..3usize, 1..=3usize, 0..3usize), 0..4),
        journey in (0..3usize, 1..=3usize),
    ) {
        tokio_test::block_on(async {
            let stack = Stack::with_trip(&SEATS).await;
            for (n, (from, len, seat)) in prior.into_iter().enumerate() {
                let to = (from + len).min(3);
                let _ = stack
                    .engine
                    .hold_seats(
                        hold_request(&format!("prior-{n}"), STOPS[from], STOPS[to], &[SEATS[seat]]),
                        Deadline::none(),
                    )
                    .await;
                settle().await;
            }

            let (from, len) = journey;
            let to = (from + len).min(3);
            let availability = stack
                .engine
                .check_availability(
                    &AvailabilityQuery {
                        org_id: ORG.to_string(),
                        trip_id: TRIP.to_string(),
                        from: STOPS[from].to_string(),
                        to: STOPS[to].to_string(),
                        quantity: 1,
                        class: None,
                    },
                    Deadline::none(),
                )
                .await
                .expect("availability");
            if availability.seats.is_empty() {
                return;
            }

            let seat_ids: Vec<&str> = availability.seats.iter().map(|s| s.seat_id.as_str()).collect();
            let granted = stack
                .engine
                .hold_seats(hold_request("fresh", STOPS[from], STOPS[to], &seat_ids), Deadline::none())
                .await;
            assert!(
                !matches!(granted, Err(InventoryError::NotAvailable { .. })),
                "reported seats were not holdable: {granted:?}"
            );
            assert!(granted.is_ok(), "{granted:?}");
        });
    }
}
