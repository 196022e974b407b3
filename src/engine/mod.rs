//! Position lifecycle engine.
//!
//! This module provides:
//! - `valuation`: pure profit computation
//! - `expiry`: the expiry-horizon evaluator
//! - `settlement`: atomic close + balance reconciliation and the sweep
//! - `modification`: audited field changes for privileged actors

pub mod expiry;
pub mod modification;
pub mod settlement;
pub mod valuation;

pub use modification::{FieldChange, FieldChangeRequest, ModificationPipeline, ModifyError};
pub use settlement::{
    CloseOverrides, SettleError, Settlement, SettlementPipeline, SweepReport,
};
