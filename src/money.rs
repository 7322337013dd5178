//! Fixed-point money helpers.
//!
//! Amounts are `Decimal` USD everywhere in the crate. SQLite has no decimal
//! type, so balances and recorded costs are stored as integer nano-dollars
//! (scale 9). Every figure produced by the cost calculator is already rounded
//! to that scale, which keeps the storage conversion lossless.

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of fractional digits kept for stored amounts.
pub const MONEY_SCALE: u32 = 9;

/// Round an amount to storage precision.
pub fn round(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a USD amount into integer storage units (nano-dollars).
///
/// Saturates at the `i64` bounds instead of wrapping.
pub fn to_units(amount: Decimal) -> i64 {
    let mut rounded = round(amount);
    rounded.rescale(MONEY_SCALE);
    let mantissa = rounded.mantissa();
    i64::try_from(mantissa).unwrap_or(if mantissa.is_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Convert integer storage units back into a USD amount. Exact.
pub fn from_units(units: i64) -> Decimal {
    Decimal::new(units, MONEY_SCALE)
}

/// Parse a decimal stored as TEXT.
pub fn parse_decimal(raw: &str) -> Result<Decimal, rust_decimal::Error> {
    raw.trim().parse::<Decimal>()
}
