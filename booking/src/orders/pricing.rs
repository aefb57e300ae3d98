//! Order totals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement currency.
pub const CURRENCY: &str = "BDT";

/// Tax on the subtotal, in percent.
pub const TAX_RATE_PERCENT: i64 = 5;

/// Booking fee charged per passenger, in paisa.
pub const BOOKING_FEE_PER_PASSENGER_PAISA: i64 = 2_000;

/// How long an order may stay unpaid.
pub const ORDER_TTL: Duration = Duration::from_secs(15 * 60);

/// Breakdown of an order's price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Sum of seat prices.
    pub subtotal_paisa: i64,
    /// Tax, floored.
    pub tax_paisa: i64,
    /// Booking fee.
    pub booking_fee_paisa: i64,
    /// Discount applied.
    pub discount_paisa: i64,
    /// Amount due, never negative.
    pub total_paisa: i64,
}

impl Totals {
    /// Price `passengers` seats costing `subtotal_paisa` in total.
    #[must_use]
    pub fn compute(subtotal_paisa: i64, passengers: usize, discount_paisa: i64) -> Self {
        let tax_paisa = subtotal_paisa.max(0) * TAX_RATE_PERCENT / 100;
        let booking_fee_paisa =
            BOOKING_FEE_PER_PASSENGER_PAISA.saturating_mul(i64::try_from(passengers).unwrap_or(i64::MAX));
        let total_paisa = subtotal_paisa
            .saturating_add(tax_paisa)
            .saturating_add(booking_fee_paisa)
            .saturating_sub(discount_paisa)
            .max(0);

        Self {
            subtotal_paisa,
            tax_paisa,
            booking_fee_paisa,
            discount_paisa,
            total_paisa,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_passengers() {
        let totals = Totals::compute(160_000, 2, 0);
        assert_eq!(totals.tax_paisa, 8_000);
        assert_eq!(totals.booking_fee_paisa, 4_000);
        assert_eq!(totals.total_paisa, 172_000);
    }

    #[test]
    fn test_tax_is_floored() {
        assert_eq!(Totals::compute(99, 1, 0).tax_paisa, 4);
    }

    #[test]
    fn test_discount_never_makes_total_negative() {
        let totals = Totals::compute(10_000, 1, 1_000_000);
        assert_eq!(totals.total_paisa, 0);
        assert_eq!(totals.discount_paisa, 1_000_000);
    }
}
