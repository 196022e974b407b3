//! Expiry-horizon evaluation for open positions.

use crate::domain::{DurationUnit, TimeMs, TradePosition};

/// Whether a position opened at `open_time` with the given horizon has
/// expired as of `now`. The boundary is inclusive: a position is expired the
/// instant its full duration has elapsed.
///
/// A non-positive duration never describes a live horizon, so it is treated
/// as already expired and the sweep retires the position.
pub fn is_expired(
    open_time: TimeMs,
    duration_value: i64,
    duration_unit: DurationUnit,
    now: TimeMs,
) -> bool {
    if duration_value <= 0 {
        return true;
    }
    let horizon_ms = duration_value.saturating_mul(duration_unit.unit_ms());
    now.since(open_time) >= horizon_ms
}

/// Expiry check against a position's own fields.
pub fn position_expired(position: &TradePosition, now: TimeMs) -> bool {
    is_expired(
        position.open_time,
        position.duration_value,
        position.duration_unit,
        now,
    )
}
