//! Atomic position settlement and the auto-close sweep.
//!
//! Settlement always re-fetches the price through the resolver chain at
//! settlement time; the stored `current_price` is display state owned by the
//! periodic refresh and is never trusted here. Atomicity and idempotence live
//! in [`Repository::settle_position`]; this pipeline decides what to write.

use crate::db::repo::SettlementWrite;
use crate::db::Repository;
use crate::domain::{Actor, Money, PositionStatus, TimeMs, TradePosition};
use crate::engine::{expiry, valuation};
use crate::pricing::{PriceError, PriceResolver};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Ledger concept tags for the two close paths.
pub const CONCEPT_AUTO_CLOSE: &str = "auto_close";
pub const CONCEPT_MANUAL_CLOSE: &str = "manual_close";

#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    Price(#[from] PriceError),
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
}

/// Outcome of one settled position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub position_id: String,
    pub instrument: String,
    pub close_price: Money,
    pub profit: Money,
    pub new_balance: Money,
    pub status: PositionStatus,
}

/// Caller-supplied overrides for the manual close path.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOverrides {
    /// Close at this price instead of fetching one.
    pub close_price: Option<Money>,
    /// Record this profit verbatim, bypassing the valuation engine.
    pub profit: Option<Money>,
    /// Settle this stake instead of the recorded one.
    pub amount: Option<Money>,
}

/// Aggregate result of one auto-close sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Open positions examined.
    pub examined: usize,
    /// How many of those had crossed their expiry boundary.
    pub expired: usize,
    /// Successfully settled positions, in traversal order.
    pub closed: Vec<Settlement>,
    /// Positions whose settlement failed this sweep (retried next sweep).
    pub failed: usize,
}

/// Drives the atomic close of positions against the price oracle and store.
pub struct SettlementPipeline {
    repo: Arc<Repository>,
    prices: PriceResolver,
}

impl SettlementPipeline {
    pub fn new(repo: Arc<Repository>, prices: PriceResolver) -> Self {
        Self { repo, prices }
    }

    /// Settle an expired position at a freshly fetched price.
    ///
    /// Returns `Ok(None)` if the position was already closed by a concurrent
    /// actor; that is a no-op, not an error.
    ///
    /// # Errors
    /// `Price` when every price source failed, `Persistence` on store failure;
    /// in both cases nothing was written and the next sweep retries.
    pub async fn settle(&self, position: &TradePosition) -> Result<Option<Settlement>, SettleError> {
        let close_price = self.prices.resolve(&position.instrument).await?;
        let profit = valuation::compute_profit(
            position.direction,
            position.open_price,
            close_price,
            position.amount,
            position.leverage,
        );
        self.write_settlement(position, close_price, profit, position.amount, CONCEPT_AUTO_CLOSE, None)
            .await
    }

    /// Manual close with optional caller-supplied price/profit/amount.
    ///
    /// A supplied profit is recorded verbatim (the owner closed at a displayed
    /// quote); otherwise profit is computed from the effective price and stake.
    pub async fn settle_manual(
        &self,
        position: &TradePosition,
        overrides: CloseOverrides,
        actor: &Actor,
    ) -> Result<Option<Settlement>, SettleError> {
        let stake = overrides.amount.unwrap_or(position.amount);
        let close_price = match overrides.close_price {
            Some(price) => price,
            None => self.prices.resolve(&position.instrument).await?,
        };
        let profit = match overrides.profit {
            Some(profit) => profit.round_cents(),
            None => valuation::compute_profit(
                position.direction,
                position.open_price,
                close_price,
                stake,
                position.leverage,
            ),
        };
        self.write_settlement(
            position,
            close_price,
            profit,
            stake,
            CONCEPT_MANUAL_CLOSE,
            Some(&actor.id),
        )
        .await
    }

    async fn write_settlement(
        &self,
        position: &TradePosition,
        close_price: Money,
        profit: Money,
        stake: Money,
        concept: &str,
        actor_id: Option<&str>,
    ) -> Result<Option<Settlement>, SettleError> {
        // The stake was reserved at open, so the worst case for the balance is
        // getting none of it back: floor the loss at the stake and mark the
        // position liquidated instead of closed.
        let (profit, final_status) = if profit <= -stake {
            (-stake, PositionStatus::Liquidated)
        } else {
            (profit, PositionStatus::Closed)
        };
        let credit = stake + profit;

        let detail = format!(
            "position {} ({}) settled: open {}, close {}, profit {}, duration {} {}(s)",
            position.id,
            position.instrument,
            position.open_price,
            close_price,
            profit,
            position.duration_value,
            position.duration_unit,
        );

        let new_balance = self
            .repo
            .settle_position(&SettlementWrite {
                position_id: &position.id,
                account_id: &position.account_id,
                final_status,
                close_price,
                profit,
                credit,
                concept,
                detail,
                actor_id,
                now: TimeMs::now(),
            })
            .await?;

        Ok(new_balance.map(|new_balance| Settlement {
            position_id: position.id.clone(),
            instrument: position.instrument.clone(),
            close_price,
            profit,
            new_balance,
            status: final_status,
        }))
    }

    /// One auto-close pass over all open positions.
    ///
    /// Oldest positions are visited first, and each item is isolated: one
    /// position's failure is logged and the sweep continues with the rest.
    pub async fn run_sweep(&self) -> Result<SweepReport, sqlx::Error> {
        let open = self.repo.open_positions().await?;
        let now = TimeMs::now();

        let examined = open.len();
        let mut expired = 0usize;
        let mut closed = Vec::new();
        let mut failed = 0usize;

        for position in &open {
            if !expiry::position_expired(position, now) {
                continue;
            }
            expired += 1;

            match self.settle(position).await {
                Ok(Some(settlement)) => {
                    info!(
                        position_id = %settlement.position_id,
                        instrument = %settlement.instrument,
                        profit = %settlement.profit,
                        "auto-closed expired position"
                    );
                    closed.push(settlement);
                }
                Ok(None) => {
                    // Lost the race to a concurrent close; nothing to do.
                }
                Err(err) => {
                    warn!(
                        position_id = %position.id,
                        instrument = %position.instrument,
                        error = %err,
                        "settlement failed, will retry next sweep"
                    );
                    failed += 1;
                }
            }
        }

        Ok(SweepReport {
            examined,
            expired,
            closed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::{Direction, DurationUnit, Role};
    use crate::pricing::MockPriceProvider;
    use std::time::Duration;
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

    fn resolver(providers: Vec<Arc<dyn crate::pricing::PriceProvider>>) -> PriceResolver {
        PriceResolver::new(providers, Duration::from_secs(1))
    }

    fn expired_position(id: &str, account_id: &str, instrument: &str) -> TradePosition {
        TradePosition {
            id: id.to_string(),
            account_id: account_id.to_string(),
            instrument: instrument.to_string(),
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
            // Opened three minutes ago with a two-minute horizon.
            open_time: TimeMs::new(TimeMs::now().as_ms() - 3 * 60_000),
            close_time: None,
        }
    }

    #[tokio::test]
    async fn test_settle_scenario_profit_and_balance() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(1_000i64))
            .await
            .unwrap();
        let position = expired_position("pos-1", "acct-1", "BTCUSDT");
        repo.insert_position(&position).await.unwrap();

        let provider =
            Arc::new(MockPriceProvider::new("primary").with_price("BTCUSDT", Money::from(51_000i64)));
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![provider]));

        let settlement = pipeline.settle(&position).await.unwrap().unwrap();
        assert_eq!(settlement.profit, Money::from(2i64));
        assert_eq!(settlement.close_price, Money::from(51_000i64));
        // previous balance + stake + profit
        assert_eq!(settlement.new_balance, Money::from(1_102i64));
        assert_eq!(settlement.status, PositionStatus::Closed);

        let ledger = repo.ledger_for_position("pos-1").await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].concept, "auto_close");
    }

    #[tokio::test]
    async fn test_settle_uses_fallback_when_primary_fails() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(0i64))
            .await
            .unwrap();
        let position = expired_position("pos-1", "acct-1", "BTCUSDT");
        repo.insert_position(&position).await.unwrap();

        let primary = Arc::new(MockPriceProvider::new("primary").always_failing());
        let fallback =
            Arc::new(MockPriceProvider::new("fallback").with_price("BTCUSDT", Money::from(50_500i64)));
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![primary, fallback]));

        let settlement = pipeline.settle(&position).await.unwrap().unwrap();
        assert_eq!(settlement.close_price, Money::from(50_500i64));
        assert_eq!(settlement.profit, Money::from(1i64));
    }

    #[tokio::test]
    async fn test_total_loss_is_floored_and_liquidates() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(1_000i64))
            .await
            .unwrap();
        let mut position = expired_position("pos-1", "acct-1", "BTCUSDT");
        position.leverage = 100;
        repo.insert_position(&position).await.unwrap();

        // -4% at 100x would be -400% of stake; the credit floors at zero.
        let provider =
            Arc::new(MockPriceProvider::new("primary").with_price("BTCUSDT", Money::from(48_000i64)));
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![provider]));

        let settlement = pipeline.settle(&position).await.unwrap().unwrap();
        assert_eq!(settlement.profit, Money::from(-100i64));
        assert_eq!(settlement.status, PositionStatus::Liquidated);
        assert_eq!(settlement.new_balance, Money::from(1_000i64));

        let stored = repo.get_position("pos-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Liquidated);
    }

    #[tokio::test]
    async fn test_manual_close_with_supplied_profit_bypasses_valuation() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(0i64))
            .await
            .unwrap();
        let position = expired_position("pos-1", "acct-1", "BTCUSDT");
        repo.insert_position(&position).await.unwrap();

        // No providers at all: a supplied price + profit must not need any.
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![]));
        let actor = Actor::new("user-1", "Uma", Role::Trader);

        let settlement = pipeline
            .settle_manual(
                &position,
                CloseOverrides {
                    close_price: Some(Money::from(50_900i64)),
                    profit: Some(Money::from(5i64)),
                    amount: None,
                },
                &actor,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(settlement.profit, Money::from(5i64));
        assert_eq!(settlement.new_balance, Money::from(105i64));

        let ledger = repo.ledger_for_position("pos-1").await.unwrap();
        assert_eq!(ledger[0].concept, "manual_close");
    }

    #[tokio::test]
    async fn test_second_settle_is_noop() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(0i64))
            .await
            .unwrap();
        let position = expired_position("pos-1", "acct-1", "BTCUSDT");
        repo.insert_position(&position).await.unwrap();

        let provider =
            Arc::new(MockPriceProvider::new("primary").with_price("BTCUSDT", Money::from(51_000i64)));
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![provider]));

        assert!(pipeline.settle(&position).await.unwrap().is_some());
        assert!(pipeline.settle(&position).await.unwrap().is_none());

        assert_eq!(repo.get_balance("acct-1").await.unwrap(), Some(Money::from(102i64)));
    }

    #[tokio::test]
    async fn test_sweep_isolates_per_item_failures() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(0i64))
            .await
            .unwrap();

        // Three expired positions; the middle one's instrument has no price
        // anywhere in the chain.
        repo.insert_position(&expired_position("pos-1", "acct-1", "BTCUSDT"))
            .await
            .unwrap();
        repo.insert_position(&expired_position("pos-2", "acct-1", "NOPRICE"))
            .await
            .unwrap();
        repo.insert_position(&expired_position("pos-3", "acct-1", "ETHUSDT"))
            .await
            .unwrap();

        let provider = Arc::new(
            MockPriceProvider::new("primary")
                .with_price("BTCUSDT", Money::from(51_000i64))
                .with_price("ETHUSDT", Money::from(3_100i64)),
        );
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![provider]));

        let report = pipeline.run_sweep().await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.expired, 3);
        assert_eq!(report.closed.len(), 2);
        assert_eq!(report.failed, 1);

        assert_eq!(
            repo.get_position("pos-1").await.unwrap().unwrap().status,
            PositionStatus::Closed
        );
        assert_eq!(
            repo.get_position("pos-2").await.unwrap().unwrap().status,
            PositionStatus::Open
        );
        assert_eq!(
            repo.get_position("pos-3").await.unwrap().unwrap().status,
            PositionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_unexpired_positions() {
        let (repo, _temp) = setup_repo().await;
        repo.create_account("acct-1", Money::from(0i64))
            .await
            .unwrap();

        let mut fresh = expired_position("pos-1", "acct-1", "BTCUSDT");
        fresh.open_time = TimeMs::now();
        fresh.duration_value = 1;
        fresh.duration_unit = DurationUnit::Day;
        repo.insert_position(&fresh).await.unwrap();

        let provider =
            Arc::new(MockPriceProvider::new("primary").with_price("BTCUSDT", Money::from(51_000i64)));
        let pipeline = SettlementPipeline::new(repo.clone(), resolver(vec![provider]));

        let report = pipeline.run_sweep().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 0);
        assert!(report.closed.is_empty());
    }
}
