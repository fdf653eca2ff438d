//! Monetary bounds.

/// Smallest units per coin.
pub const UNITS_PER_COIN: i64 = 100_000_000;

/// Largest representable amount of money, in smallest units.
pub const MAX_MONEY: i64 = 21_000_000 * UNITS_PER_COIN;

/// Whether `value` lies in the valid monetary range `0..=MAX_MONEY`.
pub fn is_valid_amount(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
