//! Account balance and audit-trail operations for the repository.

use super::{parse_money, ActivityRow, LedgerRow, ModificationRow, Repository};
use crate::domain::{Money, TimeMs};
use sqlx::Row;

impl Repository {
    /// Create an account with an initial balance, idempotently.
    ///
    /// Returns true if the account was newly created.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn create_account(&self, id: &str, balance: Money) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (id, balance)
            VALUES (?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(balance.to_canonical_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch an account's balance.
    ///
    /// Returns None for an unknown account.
    pub async fn get_balance(&self, id: &str) -> Result<Option<Money>, sqlx::Error> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| parse_money("accounts.balance", &r.get::<String, _>("balance"))))
    }

    /// Query ledger transactions referencing a position, oldest first.
    pub async fn ledger_for_position(
        &self,
        position_id: &str,
    ) -> Result<Vec<LedgerRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_account, to_account, amount, concept, status, position_id, time_ms
            FROM ledger_transactions
            WHERE position_id = ?
            ORDER BY time_ms ASC, id ASC
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| LedgerRow {
                id: row.get("id"),
                from_account: row.get("from_account"),
                to_account: row.get("to_account"),
                amount: parse_money("ledger.amount", &row.get::<String, _>("amount")),
                concept: row.get("concept"),
                status: row.get("status"),
                position_id: row.get("position_id"),
                time_ms: TimeMs::new(row.get::<i64, _>("time_ms")),
            })
            .collect())
    }

    /// Query the modification audit trail for a position, oldest first.
    pub async fn modifications_for_position(
        &self,
        position_id: &str,
    ) -> Result<Vec<ModificationRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT position_id, actor_id, actor_name, field, old_value, new_value, reason, time_ms
            FROM position_modifications
            WHERE position_id = ?
            ORDER BY time_ms ASC, id ASC
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ModificationRow {
                position_id: row.get("position_id"),
                actor_id: row.get("actor_id"),
                actor_name: row.get("actor_name"),
                field: row.get("field"),
                old_value: row.get("old_value"),
                new_value: row.get("new_value"),
                reason: row.get("reason"),
                time_ms: TimeMs::new(row.get::<i64, _>("time_ms")),
            })
            .collect())
    }

    /// Query activity-log rows for a position, oldest first.
    pub async fn activity_for_position(
        &self,
        position_id: &str,
    ) -> Result<Vec<ActivityRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT kind, detail, actor_id, position_id, time_ms
            FROM activity_log
            WHERE position_id = ?
            ORDER BY time_ms ASC, id ASC
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ActivityRow {
                kind: row.get("kind"),
                detail: row.get("detail"),
                actor_id: row.get("actor_id"),
                position_id: row.get("position_id"),
                time_ms: TimeMs::new(row.get::<i64, _>("time_ms")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use crate::domain::Money;

    #[tokio::test]
    async fn test_create_account_and_get_balance() {
        let (repo, _temp) = setup_test_db().await;

        let created = repo
            .create_account("acct-1", Money::from(1_000i64))
            .await
            .unwrap();
        assert!(created);

        let balance = repo.get_balance("acct-1").await.unwrap();
        assert_eq!(balance, Some(Money::from(1_000i64)));
    }

    #[tokio::test]
    async fn test_create_account_is_idempotent() {
        let (repo, _temp) = setup_test_db().await;

        assert!(repo
            .create_account("acct-1", Money::from(500i64))
            .await
            .unwrap());
        assert!(!repo
            .create_account("acct-1", Money::from(9_999i64))
            .await
            .unwrap());

        // Second create must not clobber the balance.
        let balance = repo.get_balance("acct-1").await.unwrap();
        assert_eq!(balance, Some(Money::from(500i64)));
    }

    #[tokio::test]
    async fn test_unknown_account_has_no_balance() {
        let (repo, _temp) = setup_test_db().await;
        assert_eq!(repo.get_balance("nobody").await.unwrap(), None);
    }
}
