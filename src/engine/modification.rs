//! Audited position modification for privileged actors.
//!
//! Every change request names the field, the value the caller saw, and the
//! value it wants. The old value is an optimistic-concurrency token: if the
//! position moved underneath the caller, the request is rejected with a
//! conflict naming the stale field instead of silently overwriting.

use crate::access::{AccessDirectory, AccessError};
use crate::db::repo::FieldAudit;
use crate::db::Repository;
use crate::domain::{
    Actor, DurationUnit, Money, PositionStatus, TimeMs, TradePosition,
};
use crate::engine::valuation;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("position not found")]
    NotFound,
    #[error("{message}")]
    Validation { field: String, message: String },
    #[error("value for {field} is stale")]
    Conflict { field: String },
    #[error("not authorized to modify this position")]
    Forbidden,
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl ModifyError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        ModifyError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// One requested change as it arrives over the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChangeRequest {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// A typed, validated change to a single position field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    CurrentPrice { old: Money, new: Money },
    StopLoss { old: Option<Money>, new: Option<Money> },
    TakeProfit { old: Option<Money>, new: Option<Money> },
    OpenPrice { old: Money, new: Money },
    Amount { old: Money, new: Money },
    Leverage { old: u32, new: u32 },
    Status { old: PositionStatus, new: PositionStatus },
    DurationValue { old: i64, new: i64 },
    DurationUnit { old: DurationUnit, new: DurationUnit },
}

fn as_money(field: &str, value: &Value) -> Result<Money, ModifyError> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ModifyError::validation(
                field,
                format!("expected a number, got {}", other),
            ))
        }
    };
    Money::from_str(&text).map_err(|e| ModifyError::validation(field, format!("bad number: {}", e)))
}

fn as_opt_money(field: &str, value: &Value) -> Result<Option<Money>, ModifyError> {
    if value.is_null() {
        return Ok(None);
    }
    as_money(field, value).map(Some)
}

fn as_int(field: &str, value: &Value) -> Result<i64, ModifyError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ModifyError::validation(field, "expected an integer")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|e| ModifyError::validation(field, format!("bad integer: {}", e))),
        other => Err(ModifyError::validation(
            field,
            format!("expected an integer, got {}", other),
        )),
    }
}

fn as_enum<T: FromStr<Err = String>>(field: &str, value: &Value) -> Result<T, ModifyError> {
    let Value::String(s) = value else {
        return Err(ModifyError::validation(
            field,
            format!("expected a string, got {}", value),
        ));
    };
    s.parse::<T>().map_err(|e| ModifyError::validation(field, e))
}

fn fmt_opt_money(value: Option<Money>) -> String {
    value
        .map(|m| m.to_canonical_string())
        .unwrap_or_else(|| "none".to_string())
}

impl FieldChange {
    /// Parse and type-check one wire-level change request.
    ///
    /// # Errors
    /// Returns `Validation` naming the field when the field is unknown or a
    /// value does not fit its type.
    pub fn parse(request: &FieldChangeRequest) -> Result<Self, ModifyError> {
        let field = request.field.as_str();
        let (old, new) = (&request.old_value, &request.new_value);

        match field {
            "currentPrice" => Ok(FieldChange::CurrentPrice {
                old: as_money(field, old)?,
                new: as_money(field, new)?,
            }),
            "stopLoss" => Ok(FieldChange::StopLoss {
                old: as_opt_money(field, old)?,
                new: as_opt_money(field, new)?,
            }),
            "takeProfit" => Ok(FieldChange::TakeProfit {
                old: as_opt_money(field, old)?,
                new: as_opt_money(field, new)?,
            }),
            "openPrice" => Ok(FieldChange::OpenPrice {
                old: as_money(field, old)?,
                new: as_money(field, new)?,
            }),
            // "stake" is the historical wire name for the amount field.
            "amount" | "stake" => Ok(FieldChange::Amount {
                old: as_money("amount", old)?,
                new: as_money("amount", new)?,
            }),
            "leverage" => {
                let parse = |v: &Value| -> Result<u32, ModifyError> {
                    u32::try_from(as_int("leverage", v)?)
                        .map_err(|_| ModifyError::validation("leverage", "out of range"))
                };
                Ok(FieldChange::Leverage {
                    old: parse(old)?,
                    new: parse(new)?,
                })
            }
            "status" => Ok(FieldChange::Status {
                old: as_enum(field, old)?,
                new: as_enum(field, new)?,
            }),
            "durationValue" => Ok(FieldChange::DurationValue {
                old: as_int(field, old)?,
                new: as_int(field, new)?,
            }),
            "durationUnit" => Ok(FieldChange::DurationUnit {
                old: as_enum(field, old)?,
                new: as_enum(field, new)?,
            }),
            other => Err(ModifyError::validation(
                "field",
                format!("unknown field: {}", other),
            )),
        }
    }

    /// Wire-level field name, as used in audit rows and conflict errors.
    pub fn field_name(&self) -> &'static str {
        match self {
            FieldChange::CurrentPrice { .. } => "currentPrice",
            FieldChange::StopLoss { .. } => "stopLoss",
            FieldChange::TakeProfit { .. } => "takeProfit",
            FieldChange::OpenPrice { .. } => "openPrice",
            FieldChange::Amount { .. } => "amount",
            FieldChange::Leverage { .. } => "leverage",
            FieldChange::Status { .. } => "status",
            FieldChange::DurationValue { .. } => "durationValue",
            FieldChange::DurationUnit { .. } => "durationUnit",
        }
    }

    /// Compare the caller's old value against the live position.
    ///
    /// # Errors
    /// Returns `Conflict` naming this field when the caller's view is stale.
    pub fn check_current(&self, position: &TradePosition) -> Result<(), ModifyError> {
        let matches = match self {
            FieldChange::CurrentPrice { old, .. } => *old == position.current_price,
            FieldChange::StopLoss { old, .. } => *old == position.stop_loss,
            FieldChange::TakeProfit { old, .. } => *old == position.take_profit,
            FieldChange::OpenPrice { old, .. } => *old == position.open_price,
            FieldChange::Amount { old, .. } => *old == position.amount,
            FieldChange::Leverage { old, .. } => *old == position.leverage,
            FieldChange::Status { old, .. } => *old == position.status,
            FieldChange::DurationValue { old, .. } => *old == position.duration_value,
            FieldChange::DurationUnit { old, .. } => *old == position.duration_unit,
        };

        if matches {
            Ok(())
        } else {
            Err(ModifyError::Conflict {
                field: self.field_name().to_string(),
            })
        }
    }

    /// Write the new value into `position`.
    pub fn apply(&self, position: &mut TradePosition) {
        match self {
            FieldChange::CurrentPrice { new, .. } => position.current_price = *new,
            FieldChange::StopLoss { new, .. } => position.stop_loss = *new,
            FieldChange::TakeProfit { new, .. } => position.take_profit = *new,
            FieldChange::OpenPrice { new, .. } => position.open_price = *new,
            FieldChange::Amount { new, .. } => position.amount = *new,
            FieldChange::Leverage { new, .. } => position.leverage = *new,
            FieldChange::Status { new, .. } => position.status = *new,
            FieldChange::DurationValue { new, .. } => position.duration_value = *new,
            FieldChange::DurationUnit { new, .. } => position.duration_unit = *new,
        }
    }

    /// Audit-trail row for this change.
    pub fn audit(&self) -> FieldAudit {
        let (old_value, new_value) = match self {
            FieldChange::CurrentPrice { old, new }
            | FieldChange::OpenPrice { old, new }
            | FieldChange::Amount { old, new } => {
                (old.to_canonical_string(), new.to_canonical_string())
            }
            FieldChange::StopLoss { old, new } | FieldChange::TakeProfit { old, new } => {
                (fmt_opt_money(*old), fmt_opt_money(*new))
            }
            FieldChange::Leverage { old, new } => (old.to_string(), new.to_string()),
            FieldChange::Status { old, new } => {
                (old.as_str().to_string(), new.as_str().to_string())
            }
            FieldChange::DurationValue { old, new } => (old.to_string(), new.to_string()),
            FieldChange::DurationUnit { old, new } => {
                (old.as_str().to_string(), new.as_str().to_string())
            }
        };

        FieldAudit {
            field: self.field_name().to_string(),
            old_value,
            new_value,
        }
    }

    fn affects_valuation_inputs(&self) -> bool {
        matches!(
            self,
            FieldChange::CurrentPrice { .. }
                | FieldChange::OpenPrice { .. }
                | FieldChange::Amount { .. }
        )
    }
}

/// Applies validated, authorized, audited field changes to positions.
pub struct ModificationPipeline {
    repo: Arc<Repository>,
    access: Arc<dyn AccessDirectory>,
}

impl ModificationPipeline {
    pub fn new(repo: Arc<Repository>, access: Arc<dyn AccessDirectory>) -> Self {
        Self { repo, access }
    }

    /// Admins modify anything; mentors only positions of accounts they are
    /// assigned to. Traders never use this path.
    async fn authorize(&self, actor: &Actor, position: &TradePosition) -> Result<(), ModifyError> {
        if actor.is_admin() {
            return Ok(());
        }
        if actor.is_mentor()
            && self
                .access
                .is_mentor_assigned(&actor.id, &position.account_id)
                .await?
        {
            return Ok(());
        }
        Err(ModifyError::Forbidden)
    }

    /// Validate and atomically apply a batch of field changes.
    ///
    /// The whole batch succeeds or nothing is written. Returns the updated
    /// position.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden`, `Validation` (bad field/value/invariant,
    /// empty reason, position not open), `Conflict` (stale old value, or the
    /// position changed between validation and the write).
    pub async fn modify(
        &self,
        position_id: &str,
        requests: &[FieldChangeRequest],
        reason: &str,
        actor: &Actor,
    ) -> Result<TradePosition, ModifyError> {
        if reason.trim().is_empty() {
            return Err(ModifyError::validation("reason", "a reason is required"));
        }
        if requests.is_empty() {
            return Err(ModifyError::validation(
                "modifications",
                "at least one change is required",
            ));
        }

        let position = self
            .repo
            .get_position(position_id)
            .await?
            .ok_or(ModifyError::NotFound)?;

        self.authorize(actor, &position).await?;

        // Settled positions are immutable. This also rules out reopening:
        // the state machine leaves `open` exactly once, and the stake was
        // already credited back when it did.
        if !position.status.is_open() {
            return Err(ModifyError::validation(
                "status",
                "only open positions can be modified",
            ));
        }

        let changes = requests
            .iter()
            .map(FieldChange::parse)
            .collect::<Result<Vec<_>, _>>()?;

        for change in &changes {
            change.check_current(&position)?;
        }

        let now = TimeMs::now();
        let mut updated = position.clone();
        for change in &changes {
            change.apply(&mut updated);
        }

        // Keep the close-time invariant when a status change is in the batch,
        // and refix profit if the closing request also moved a valuation
        // input.
        let closes = !updated.status.is_open();
        if closes {
            updated.close_time = Some(now);
        }
        if closes && changes.iter().any(FieldChange::affects_valuation_inputs) {
            updated.profit = Some(valuation::compute_profit(
                updated.direction,
                updated.open_price,
                updated.current_price,
                updated.amount,
                updated.leverage,
            ));
        }

        updated
            .validate()
            .map_err(|v| ModifyError::validation(v.field, v.message))?;

        let audits: Vec<FieldAudit> = changes.iter().map(FieldChange::audit).collect();
        let fields: Vec<&str> = changes.iter().map(FieldChange::field_name).collect();
        let detail = format!(
            "position {} modified by {}: {}",
            position.id,
            actor.display_name,
            fields.join(", ")
        );

        let applied = self
            .repo
            .update_position_audited(
                &updated,
                position.status,
                actor,
                &audits,
                reason.trim(),
                &detail,
                now,
            )
            .await?;

        if !applied {
            // The position left its observed status between our read and the
            // guarded write.
            return Err(ModifyError::Conflict {
                field: "status".to_string(),
            });
        }

        info!(
            position_id = %position.id,
            actor_id = %actor.id,
            fields = %fields.join(","),
            "position modified"
        );

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MockAccessDirectory;
    use crate::db::migrations::init_db;
    use crate::domain::{Direction, Role};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_repo() -> (Arc<Repository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Arc::new(Repository::new(pool)), temp_dir)
    }

    fn open_position(id: &str, account_id: &str) -> TradePosition {
        TradePosition {
            id: id.to_string(),
            account_id: account_id.to_string(),
            instrument: "BTCUSDT".to_string(),
            direction: Direction::Long,
            open_price: Money::from(50_000i64),
            current_price: Money::from(50_000i64),
            amount: Money::from(100i64),
            leverage: 1,
            stop_loss: None,
            take_profit: None,
            duration_value: 2,
            duration_unit: DurationUnit::Minute,
            status: PositionStatus::Open,
            profit: None,
            open_time: TimeMs::new(1_700_000_000_000),
            close_time: None,
        }
    }

    fn request(field: &str, old: Value, new: Value) -> FieldChangeRequest {
        FieldChangeRequest {
            field: field.to_string(),
            old_value: old,
            new_value: new,
        }
    }

    #[test]
    fn test_parse_known_fields() {
        let change =
            FieldChange::parse(&request("currentPrice", json!(50000), json!("51000.5"))).unwrap();
        assert_eq!(
            change,
            FieldChange::CurrentPrice {
                old: Money::from(50_000i64),
                new: Money::from_str("51000.5").unwrap(),
            }
        );

        let change = FieldChange::parse(&request("stopLoss", json!(null), json!(49000))).unwrap();
        assert_eq!(
            change,
            FieldChange::StopLoss {
                old: None,
                new: Some(Money::from(49_000i64)),
            }
        );

        // Historical alias.
        let change = FieldChange::parse(&request("stake", json!(100), json!(150))).unwrap();
        assert_eq!(change.field_name(), "amount");

        let change = FieldChange::parse(&request("status", json!("open"), json!("closed"))).unwrap();
        assert_eq!(
            change,
            FieldChange::Status {
                old: PositionStatus::Open,
                new: PositionStatus::Closed,
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_field_and_bad_values() {
        let err = FieldChange::parse(&request("color", json!(1), json!(2))).unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "field"));

        let err =
            FieldChange::parse(&request("leverage", json!(1), json!("lots"))).unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "leverage"));

        let err = FieldChange::parse(&request("status", json!("open"), json!("paused"))).unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "status"));
    }

    #[test]
    fn test_check_current_detects_stale_old_value() {
        let position = open_position("pos-1", "acct-1");
        let fresh = FieldChange::parse(&request("leverage", json!(1), json!(10))).unwrap();
        assert!(fresh.check_current(&position).is_ok());

        let stale = FieldChange::parse(&request("leverage", json!(5), json!(10))).unwrap();
        let err = stale.check_current(&position).unwrap_err();
        assert!(matches!(err, ModifyError::Conflict { field } if field == "leverage"));
    }

    async fn setup_pipeline(
        access: MockAccessDirectory,
    ) -> (ModificationPipeline, Arc<Repository>, TempDir) {
        let (repo, temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(1_000i64))
            .await
            .unwrap();
        repo.insert_position(&open_position("pos-1", "acct-1"))
            .await
            .unwrap();
        let pipeline = ModificationPipeline::new(repo.clone(), Arc::new(access));
        (pipeline, repo, temp)
    }

    #[tokio::test]
    async fn test_admin_modifies_and_trail_is_written() {
        let (pipeline, repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);

        let updated = pipeline
            .modify(
                "pos-1",
                &[
                    request("leverage", json!(1), json!(10)),
                    request("stopLoss", json!(null), json!(49000)),
                ],
                "risk adjustment",
                &admin,
            )
            .await
            .unwrap();

        assert_eq!(updated.leverage, 10);
        assert_eq!(updated.stop_loss, Some(Money::from(49_000i64)));

        let trail = repo.modifications_for_position("pos-1").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].field, "leverage");
        assert_eq!(trail[0].old_value, "1");
        assert_eq!(trail[0].new_value, "10");
        assert_eq!(trail[1].field, "stopLoss");
        assert_eq!(trail[1].old_value, "none");
        assert_eq!(trail[0].reason, "risk adjustment");
    }

    #[tokio::test]
    async fn test_assigned_mentor_allowed_unassigned_forbidden() {
        let access = MockAccessDirectory::new().with_assignment("mentor-1", "acct-1");
        let (pipeline, _repo, _temp) = setup_pipeline(access).await;

        let assigned = Actor::new("mentor-1", "Mia", Role::Mentor);
        assert!(pipeline
            .modify(
                "pos-1",
                &[request("leverage", json!(1), json!(2))],
                "coaching",
                &assigned,
            )
            .await
            .is_ok());

        let unassigned = Actor::new("mentor-2", "Moe", Role::Mentor);
        let err = pipeline
            .modify(
                "pos-1",
                &[request("leverage", json!(2), json!(3))],
                "coaching",
                &unassigned,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Forbidden));
    }

    #[tokio::test]
    async fn test_trader_is_forbidden() {
        let (pipeline, _repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let trader = Actor::new("user-1", "Uma", Role::Trader);

        let err = pipeline
            .modify(
                "pos-1",
                &[request("leverage", json!(1), json!(2))],
                "self-service",
                &trader,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Forbidden));
    }

    #[tokio::test]
    async fn test_empty_reason_and_missing_position() {
        let (pipeline, _repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);

        let err = pipeline
            .modify(
                "pos-1",
                &[request("leverage", json!(1), json!(2))],
                "   ",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "reason"));

        let err = pipeline
            .modify(
                "missing",
                &[request("leverage", json!(1), json!(2))],
                "why",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::NotFound));
    }

    #[tokio::test]
    async fn test_stale_old_value_is_a_conflict() {
        let (pipeline, _repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);

        let err = pipeline
            .modify(
                "pos-1",
                &[request("currentPrice", json!(44000), json!(51000))],
                "price fix",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Conflict { field } if field == "currentPrice"));
    }

    #[tokio::test]
    async fn test_protection_bounds_enforced_after_apply() {
        let (pipeline, _repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);

        // A stop-loss above the open price is invalid for a long position.
        let err = pipeline
            .modify(
                "pos-1",
                &[request("stopLoss", json!(null), json!(55000))],
                "bad bound",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "stopLoss"));
    }

    #[tokio::test]
    async fn test_close_via_status_recomputes_profit_with_new_price() {
        let (pipeline, repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);

        let updated = pipeline
            .modify(
                "pos-1",
                &[
                    request("currentPrice", json!(50000), json!(51000)),
                    request("status", json!("open"), json!("closed")),
                ],
                "manual reconciliation",
                &admin,
            )
            .await
            .unwrap();

        assert_eq!(updated.status, PositionStatus::Closed);
        assert!(updated.close_time.is_some());
        assert_eq!(updated.profit, Some(Money::from(2i64)));

        let stored = repo.get_position("pos-1").await.unwrap().unwrap();
        assert_eq!(stored.profit, Some(Money::from(2i64)));
    }

    async fn settle_pos_1(repo: &Repository) {
        repo.settle_position(&crate::db::repo::SettlementWrite {
            position_id: "pos-1",
            account_id: "acct-1",
            final_status: PositionStatus::Closed,
            close_price: Money::from(51_000i64),
            profit: Money::from(2i64),
            credit: Money::from(102i64),
            concept: "auto_close",
            detail: "settled".to_string(),
            actor_id: None,
            now: TimeMs::new(10_000),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_settled_position_rejects_field_changes() {
        let (pipeline, repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);
        settle_pos_1(&repo).await;

        // The old value matches the settled row exactly, so only the
        // open-status check stands between the caller and the write.
        let err = pipeline
            .modify(
                "pos-1",
                &[request("leverage", json!(1), json!(10))],
                "late adjustment",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "status"));

        let stored = repo.get_position("pos-1").await.unwrap().unwrap();
        assert_eq!(stored.leverage, 1);
    }

    #[tokio::test]
    async fn test_settled_position_cannot_be_reopened() {
        let (pipeline, repo, _temp) = setup_pipeline(MockAccessDirectory::new()).await;
        let admin = Actor::new("admin-1", "Ada", Role::Admin);
        settle_pos_1(&repo).await;

        let err = pipeline
            .modify(
                "pos-1",
                &[request("status", json!("closed"), json!("open"))],
                "undo the close",
                &admin,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModifyError::Validation { field, .. } if field == "status"));

        // The settlement record survives untouched.
        let stored = repo.get_position("pos-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Closed);
        assert_eq!(stored.profit, Some(Money::from(2i64)));
        assert!(stored.close_time.is_some());
    }
}
