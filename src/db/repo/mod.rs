//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `accounts.rs` - Account balances and the append-only audit trails
//! - `positions.rs` - Position lifecycle reads and the atomic settlement /
//!   modification transactions

mod accounts;
mod positions;

use crate::domain::{Money, TimeMs};
use sqlx::sqlite::SqlitePool;
use std::str::FromStr;
use tracing::warn;

pub use positions::SettlementWrite;

/// The counterparty account name used for platform-side ledger entries.
pub const PLATFORM_ACCOUNT: &str = "platform";

/// One row of the append-only ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: Money,
    pub concept: String,
    pub status: String,
    pub position_id: Option<String>,
    pub time_ms: TimeMs,
}

/// One row of the position-modification audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationRow {
    pub position_id: String,
    pub actor_id: String,
    pub actor_name: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub reason: String,
    pub time_ms: TimeMs,
}

/// One row of the activity log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    pub kind: String,
    pub detail: String,
    pub actor_id: Option<String>,
    pub position_id: Option<String>,
    pub time_ms: TimeMs,
}

/// A single field change to record in the modification audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAudit {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Repository for database operations.
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }
}

/// Parse a stored canonical decimal string, defaulting to zero on corruption.
///
/// Decimal columns are TEXT; SQLite's numeric aggregates would go through
/// REAL and lose precision, so every read re-parses in Rust.
pub(crate) fn parse_money(context: &str, s: &str) -> Money {
    Money::from_str(s).unwrap_or_else(|e| {
        warn!(
            context,
            value = %s,
            error = %e,
            "Failed to parse stored decimal, using zero"
        );
        Money::default()
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Repository;
    use crate::db::migrations::init_db;
    use tempfile::TempDir;

    pub async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }
}
