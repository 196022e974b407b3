//! Domain types for the simulated-trading core.
//!
//! This module provides:
//! - Lossless numeric handling via the Money wrapper
//! - Epoch-millisecond timestamps via TimeMs
//! - The TradePosition model with its field-level invariants
//! - Actor identity and roles for the privileged paths

pub mod actor;
pub mod money;
pub mod position;
pub mod time;

pub use actor::{Actor, Role};
pub use money::Money;
pub use position::{
    Direction, DurationUnit, InvariantViolation, PositionStatus, TradePosition, MAX_LEVERAGE,
    MIN_LEVERAGE,
};
pub use time::TimeMs;
