//! Journey → segment index derivation.

use super::InventoryError;
use seatline_core::inventory::SegmentRange;

/// Segments covered by a journey from `from` to `to` along `stops`.
///
/// With stops `[S0..Sn]` and a journey `(Sa, Sb)`, `0 <= a < b <= n`, the
/// journey needs segments `a..b`.
///
/// # Errors
///
/// Returns [`InventoryError::InvalidRange`] if either station is not a stop or
/// `from` is not strictly before `to`.
pub fn derive_segments(stops: &[String], from: &str, to: &str) -> Result<SegmentRange, InventoryError> {
    let invalid = || InventoryError::InvalidRange {
        from: from.to_string(),
        to: to.to_string(),
    };

    let start = stops.iter().position(|s| s == from).ok_or_else(invalid)?;
    let end = stops.iter().position(|s| s == to).ok_or_else(invalid)?;
    if start >= end {
        return Err(invalid());
    }

    let start = u32::try_from(start).map_err(|_| invalid())?;
    let end = u32::try_from(end).map_err(|_| invalid())?;
    Ok(SegmentRange::new(start, end))
}
