//! Position lifecycle operations for the repository.
//!
//! The two write paths here are the platform's correctness core: both the
//! settlement close and the audited modification run as single SQLite
//! transactions guarded by a compare-and-swap on the position's status, so a
//! position can only ever leave the `open` state once.

use super::{parse_money, FieldAudit, Repository, PLATFORM_ACCOUNT};
use crate::domain::{
    Actor, Direction, DurationUnit, Money, PositionStatus, TimeMs, TradePosition,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Everything the atomic settlement transaction writes.
#[derive(Debug)]
pub struct SettlementWrite<'a> {
    pub position_id: &'a str,
    pub account_id: &'a str,
    /// `Closed`, or `Liquidated` when the loss consumed the whole stake.
    pub final_status: PositionStatus,
    pub close_price: Money,
    pub profit: Money,
    /// Balance delta: stake + profit, floored at zero.
    pub credit: Money,
    /// Ledger concept tag: "auto_close" or "manual_close".
    pub concept: &'a str,
    /// Human-readable settlement summary for the activity log.
    pub detail: String,
    /// None for scheduler-driven closes.
    pub actor_id: Option<&'a str>,
    pub now: TimeMs,
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn position_from_row(row: &SqliteRow) -> Result<TradePosition, sqlx::Error> {
    let direction = row
        .get::<String, _>("direction")
        .parse::<Direction>()
        .map_err(decode_err)?;
    let duration_unit = row
        .get::<String, _>("duration_unit")
        .parse::<DurationUnit>()
        .map_err(decode_err)?;
    let status = row
        .get::<String, _>("status")
        .parse::<PositionStatus>()
        .map_err(decode_err)?;
    let leverage = u32::try_from(row.get::<i64, _>("leverage"))
        .map_err(|e| decode_err(format!("bad leverage: {}", e)))?;

    Ok(TradePosition {
        id: row.get("id"),
        account_id: row.get("account_id"),
        instrument: row.get("instrument"),
        direction,
        open_price: parse_money("positions.open_price", &row.get::<String, _>("open_price")),
        current_price: parse_money(
            "positions.current_price",
            &row.get::<String, _>("current_price"),
        ),
        amount: parse_money("positions.amount", &row.get::<String, _>("amount")),
        leverage,
        stop_loss: row
            .get::<Option<String>, _>("stop_loss")
            .map(|s| parse_money("positions.stop_loss", &s)),
        take_profit: row
            .get::<Option<String>, _>("take_profit")
            .map(|s| parse_money("positions.take_profit", &s)),
        duration_value: row.get("duration_value"),
        duration_unit,
        status,
        profit: row
            .get::<Option<String>, _>("profit")
            .map(|s| parse_money("positions.profit", &s)),
        open_time: TimeMs::new(row.get::<i64, _>("open_time_ms")),
        close_time: row.get::<Option<i64>, _>("close_time_ms").map(TimeMs::new),
    })
}

const POSITION_COLUMNS: &str = "id, account_id, instrument, direction, open_price, current_price, \
     amount, leverage, stop_loss, take_profit, duration_value, duration_unit, status, profit, \
     open_time_ms, close_time_ms";

impl Repository {
    /// Insert a freshly opened position.
    ///
    /// # Errors
    /// Returns an error if the insert fails (duplicate id, unknown account).
    pub async fn insert_position(&self, position: &TradePosition) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO positions
            (id, account_id, instrument, direction, open_price, current_price, amount, leverage,
             stop_loss, take_profit, duration_value, duration_unit, status, profit,
             open_time_ms, close_time_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.account_id)
        .bind(&position.instrument)
        .bind(position.direction.as_str())
        .bind(position.open_price.to_canonical_string())
        .bind(position.current_price.to_canonical_string())
        .bind(position.amount.to_canonical_string())
        .bind(position.leverage as i64)
        .bind(position.stop_loss.map(|m| m.to_canonical_string()))
        .bind(position.take_profit.map(|m| m.to_canonical_string()))
        .bind(position.duration_value)
        .bind(position.duration_unit.as_str())
        .bind(position.status.as_str())
        .bind(position.profit.map(|m| m.to_canonical_string()))
        .bind(position.open_time.as_ms())
        .bind(position.close_time.map(|t| t.as_ms()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a position by id.
    pub async fn get_position(&self, id: &str) -> Result<Option<TradePosition>, sqlx::Error> {
        let sql = format!("SELECT {} FROM positions WHERE id = ?", POSITION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.map(|r| position_from_row(&r)).transpose()
    }

    /// List positions with optional status and owner filters.
    ///
    /// Ordered by open time ascending (oldest first), which is also the sweep
    /// traversal order: a slow failure on one position must not starve
    /// longer-waiting ones.
    pub async fn list_positions(
        &self,
        status: Option<PositionStatus>,
        account_id: Option<&str>,
    ) -> Result<Vec<TradePosition>, sqlx::Error> {
        let mut sql = format!("SELECT {} FROM positions WHERE 1=1", POSITION_COLUMNS);
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if account_id.is_some() {
            sql.push_str(" AND account_id = ?");
        }
        sql.push_str(" ORDER BY open_time_ms ASC, id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(account_id) = account_id {
            query = query.bind(account_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }

    /// All open positions, oldest first.
    pub async fn open_positions(&self) -> Result<Vec<TradePosition>, sqlx::Error> {
        self.list_positions(Some(PositionStatus::Open), None).await
    }

    /// Atomically close a position and reconcile the owner's balance.
    ///
    /// All-or-nothing within one transaction:
    /// 1. transition the position, guarded by `status = 'open'`
    /// 2. credit the owning account
    /// 3. append one ledger transaction
    /// 4. append one activity row
    ///
    /// Returns `Ok(None)` without writing anything when the position had
    /// already left the open state, which makes concurrent settlement a
    /// no-op rather than a double credit.
    ///
    /// # Errors
    /// Returns an error if any statement fails; the transaction rolls back.
    pub async fn settle_position(
        &self,
        write: &SettlementWrite<'_>,
    ) -> Result<Option<Money>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = ?, close_time_ms = ?, current_price = ?, profit = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(write.final_status.as_str())
        .bind(write.now.as_ms())
        .bind(write.close_price.to_canonical_string())
        .bind(write.profit.to_canonical_string())
        .bind(write.position_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT balance FROM accounts WHERE id = ?")
            .bind(write.account_id)
            .fetch_one(&mut *tx)
            .await?;
        let balance = parse_money("accounts.balance", &row.get::<String, _>("balance"));
        let new_balance = balance + write.credit;

        sqlx::query("UPDATE accounts SET balance = ? WHERE id = ?")
            .bind(new_balance.to_canonical_string())
            .bind(write.account_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_transactions
            (id, from_account, to_account, amount, concept, status, position_id, time_ms)
            VALUES (?, ?, ?, ?, ?, 'completed', ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(PLATFORM_ACCOUNT)
        .bind(write.account_id)
        .bind(write.credit.to_canonical_string())
        .bind(write.concept)
        .bind(write.position_id)
        .bind(write.now.as_ms())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO activity_log (kind, detail, actor_id, position_id, time_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(write.concept)
        .bind(&write.detail)
        .bind(write.actor_id)
        .bind(write.position_id)
        .bind(write.now.as_ms())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(new_balance))
    }

    /// Atomically apply an audited modification to a position.
    ///
    /// Writes the full updated row guarded by the status observed when the
    /// request was validated, one audit row per changed field, and one
    /// activity row for the whole request. Returns false (and writes nothing)
    /// when the guard fails, meaning the position was settled or edited
    /// concurrently.
    ///
    /// # Errors
    /// Returns an error if any statement fails; the transaction rolls back.
    pub async fn update_position_audited(
        &self,
        updated: &TradePosition,
        expected_status: PositionStatus,
        actor: &Actor,
        audits: &[FieldAudit],
        reason: &str,
        detail: &str,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET open_price = ?, current_price = ?, amount = ?, leverage = ?,
                stop_loss = ?, take_profit = ?, duration_value = ?, duration_unit = ?,
                status = ?, profit = ?, close_time_ms = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(updated.open_price.to_canonical_string())
        .bind(updated.current_price.to_canonical_string())
        .bind(updated.amount.to_canonical_string())
        .bind(updated.leverage as i64)
        .bind(updated.stop_loss.map(|m| m.to_canonical_string()))
        .bind(updated.take_profit.map(|m| m.to_canonical_string()))
        .bind(updated.duration_value)
        .bind(updated.duration_unit.as_str())
        .bind(updated.status.as_str())
        .bind(updated.profit.map(|m| m.to_canonical_string()))
        .bind(updated.close_time.map(|t| t.as_ms()))
        .bind(&updated.id)
        .bind(expected_status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for audit in audits {
            sqlx::query(
                r#"
                INSERT INTO position_modifications
                (position_id, actor_id, actor_name, field, old_value, new_value, reason, time_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&updated.id)
            .bind(&actor.id)
            .bind(&actor.display_name)
            .bind(&audit.field)
            .bind(&audit.old_value)
            .bind(&audit.new_value)
            .bind(reason)
            .bind(now.as_ms())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO activity_log (kind, detail, actor_id, position_id, time_ms)
            VALUES ('position_modified', ?, ?, ?, ?)
            "#,
        )
        .bind(detail)
        .bind(&actor.id)
        .bind(&updated.id)
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
