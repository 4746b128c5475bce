//! Fixed-point exchange-rate arithmetic
//!
//! The exchange rate is a decimal number of foreign currency units per token
//! unit. Foreign amounts are carried in 8-fractional-digit minor units, and
//! the rate itself is persisted in the sentinel row as an integer scaled by
//! 10^8. All conversions truncate toward zero so a computed amount never
//! exceeds what the rate covers.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Fractional digits carried by foreign amounts and the stored rate
pub const RATE_SCALE: u32 = 8;

const SCALE_FACTOR: i64 = 100_000_000;

/// Encode a rate for the sentinel row (rate * 10^8, truncated).
///
/// Returns `None` if the rate does not fit the storage column.
pub fn encode(rate: Decimal) -> Option<i64> {
    rate.checked_mul(Decimal::from(SCALE_FACTOR))?.trunc().to_i64()
}

/// Decode a stored rate, dropping trailing fractional zeros
pub fn decode(raw: i64) -> Decimal {
    Decimal::new(raw, RATE_SCALE).normalize()
}

/// Foreign minor units paid out for a redeemed token amount
pub fn foreign_amount(native_amount: i64, rate: Decimal) -> Option<i64> {
    Decimal::from(native_amount)
        .checked_mul(rate)?
        .checked_mul(Decimal::from(SCALE_FACTOR))?
        .trunc()
        .to_i64()
}

/// Token units issued for a deposited foreign amount in minor units
pub fn native_amount(foreign_amount: i64, rate: Decimal) -> Option<i64> {
    let scaled_rate = rate.checked_mul(Decimal::from(SCALE_FACTOR))?;
    if scaled_rate <= Decimal::ZERO {
        return None;
    }
    Decimal::from(foreign_amount)
        .checked_div(scaled_rate)?
        .trunc()
        .to_i64()
}
