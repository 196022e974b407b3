//! Trade position model and its invariants.
//!
//! A position is a single leveraged long/short exposure opened by an account
//! against an instrument. Positions are never deleted; they transition
//! open -> closed or open -> liquidated exactly once.

use super::{Money, TimeMs};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Leverage must stay within this inclusive range.
pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 1000;

/// Long or short exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Signed multiplier for profit computation (+1 long, -1 short).
    pub fn factor(&self) -> i32 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position lifecycle state.
///
/// `close_time` is set if and only if the status is not `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Liquidated => "liquidated",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, PositionStatus::Open)
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            "liquidated" => Ok(PositionStatus::Liquidated),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit of the position's expiry horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Minute,
    Hour,
    Day,
}

impl DurationUnit {
    /// Milliseconds per single unit.
    pub fn unit_ms(&self) -> i64 {
        match self {
            DurationUnit::Minute => 60_000,
            DurationUnit::Hour => 3_600_000,
            DurationUnit::Day => 86_400_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Minute => "minute",
            DurationUnit::Hour => "hour",
            DurationUnit::Day => "day",
        }
    }
}

impl FromStr for DurationUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(DurationUnit::Minute),
            "hour" => Ok(DurationUnit::Hour),
            "day" => Ok(DurationUnit::Day),
            other => Err(format!("unknown duration unit: {}", other)),
        }
    }
}

impl std::fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A field-level invariant violation, surfaced to callers as a validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub field: &'static str,
    pub message: String,
}

impl InvariantViolation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        InvariantViolation {
            field,
            message: message.into(),
        }
    }
}

/// An open leveraged exposure owned by exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePosition {
    pub id: String,
    pub account_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub open_price: Money,
    pub current_price: Money,
    /// Stake: the ledger amount committed at open.
    pub amount: Money,
    pub leverage: u32,
    pub stop_loss: Option<Money>,
    pub take_profit: Option<Money>,
    pub duration_value: i64,
    pub duration_unit: DurationUnit,
    pub status: PositionStatus,
    /// None while open; fixed exactly once at close.
    pub profit: Option<Money>,
    pub open_time: TimeMs,
    pub close_time: Option<TimeMs>,
}

impl TradePosition {
    /// Check every field-level invariant.
    ///
    /// Returns the first violation found, naming the offending field.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if !self.open_price.is_positive() {
            return Err(InvariantViolation::new("openPrice", "must be positive"));
        }
        if !self.current_price.is_positive() {
            return Err(InvariantViolation::new("currentPrice", "must be positive"));
        }
        if !self.amount.is_positive() {
            return Err(InvariantViolation::new("amount", "must be positive"));
        }
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&self.leverage) {
            return Err(InvariantViolation::new(
                "leverage",
                format!("must be between {} and {}", MIN_LEVERAGE, MAX_LEVERAGE),
            ));
        }
        if self.duration_value <= 0 {
            return Err(InvariantViolation::new("durationValue", "must be positive"));
        }
        if self.status.is_open() != self.close_time.is_none() {
            return Err(InvariantViolation::new(
                "closeTime",
                "set if and only if the position is not open",
            ));
        }
        self.validate_protections()
    }

    /// Direction-aware stop-loss / take-profit bounds relative to the open price.
    ///
    /// Long: stopLoss < openPrice < takeProfit. Short: the inverse.
    pub fn validate_protections(&self) -> Result<(), InvariantViolation> {
        match self.direction {
            Direction::Long => {
                if let Some(sl) = self.stop_loss {
                    if sl >= self.open_price {
                        return Err(InvariantViolation::new(
                            "stopLoss",
                            "must be below the open price for a long position",
                        ));
                    }
                }
                if let Some(tp) = self.take_profit {
                    if tp <= self.open_price {
                        return Err(InvariantViolation::new(
                            "takeProfit",
                            "must be above the open price for a long position",
                        ));
                    }
                }
            }
            Direction::Short => {
                if let Some(sl) = self.stop_loss {
                    if sl <= self.open_price {
                        return Err(InvariantViolation::new(
                            "stopLoss",
                            "must be above the open price for a short position",
                        ));
                    }
                }
                if let Some(tp) = self.take_profit {
                    if tp >= self.open_price {
                        return Err(InvariantViolation::new(
                            "takeProfit",
                            "must be below the open price for a short position",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// The expiry horizon in milliseconds from `open_time`.
    pub fn duration_ms(&self) -> i64 {
        self.duration_value.saturating_mul(self.duration_unit.unit_ms())
    }
}
