//! Pure profit computation for a settled position.

use crate::domain::{Direction, Money};

/// Profit for closing a position at `close_price`.
///
/// Long: `(close - open) / open x stake x leverage`; short is the negation.
/// Rounded to two decimal places, so re-evaluating a closed position always
/// yields the identical figure.
pub fn compute_profit(
    direction: Direction,
    open_price: Money,
    close_price: Money,
    stake: Money,
    leverage: u32,
) -> Money {
    let move_fraction = (close_price - open_price) / open_price;
    let raw = move_fraction * stake * Money::from(leverage);

    let signed = match direction {
        Direction::Long => raw,
        Direction::Short => -raw,
    };
    signed.round_cents()
}
