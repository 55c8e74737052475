//! The dealer control loop.
//!
//! One tick runs three phases in strict order:
//! 1. Settlement sweep over in-flight on-chain transfers
//! 2. Position adjustment against the current USD liability
//! 3. Collateral rebalance, gated on an empty in-flight set
//!
//! Phases 2 and 3 degrade independently: a failed position update does not
//! stop the rebalance (position and collateral are separate concerns on the
//! exchange), and the aggregated result surfaces the most informative error.

mod callbacks;
mod reconciler;

pub use callbacks::TransferCallbacks;

use crate::ledger::{TickSnapshot, TransferLedger};
use crate::strategy::{HedgingStrategy, LeverageDelta, PositionDelta};
use crate::wallet::WalletClient;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::field::Empty;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Outcome of a single dealer tick.
///
/// A phase that was skipped carries no delta; a phase that ran carries the
/// delta its strategy call reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub position_skipped: bool,
    pub position_delta: Option<PositionDelta>,
    pub leverage_skipped: bool,
    pub leverage_delta: Option<LeverageDelta>,
}

/// Reconciliation and hedging control loop for one liability/exchange pair.
///
/// Single-writer: callers must not run two ticks of the same instance
/// concurrently. The ledger is the only state carried between ticks.
pub struct Dealer {
    wallet: Arc<dyn WalletClient>,
    strategy: Arc<dyn HedgingStrategy>,
    ledger: Arc<TransferLedger>,
    minimum_positive_liability_usd: Decimal,
}

impl Dealer {
    /// Create a dealer bound to a wallet, a strategy and a transfer ledger.
    pub fn new(
        wallet: Arc<dyn WalletClient>,
        strategy: Arc<dyn HedgingStrategy>,
        ledger: Arc<TransferLedger>,
        minimum_positive_liability_usd: Decimal,
    ) -> Self {
        Self {
            wallet,
            strategy,
            ledger,
            minimum_positive_liability_usd,
        }
    }

    /// Run one end-to-end tick: settle in-flight transfers, adjust the
    /// position, rebalance collateral.
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.update_in_flight_transfers().await?;
        self.update_position_and_leverage().await
    }

    async fn update_position_and_leverage(&self) -> Result<TickOutcome> {
        let span = info_span!(
            "app.dealer.updatePositionAndLeverage",
            usdLiability = Empty,
            btcPriceInUsd = Empty,
            activeStrategy = %self.strategy.name(),
            positionSkipped = Empty,
            positionSuccess = Empty,
            positionOutcome = Empty,
            leverageSkipped = Empty,
            leverageSuccess = Empty,
            leverageOutcome = Empty,
            pendingTransfers = Empty,
        );

        let inner = async {
            let span = Span::current();

            let btc_price_in_usd = self.strategy.get_btc_spot_price_in_usd().await?;
            anyhow::ensure!(
                btc_price_in_usd > Decimal::ZERO,
                "BtcSpotPriceInUsd must be positive, got {btc_price_in_usd}"
            );
            span.record("btcPriceInUsd", tracing::field::display(btc_price_in_usd));

            let usd_liability = self.fetch_usd_liability().await?;
            span.record("usdLiability", tracing::field::display(usd_liability));

            let (position_skipped, position_result) = self
                .run_position_phase(usd_liability, btc_price_in_usd)
                .await;
            record_phase(
                &span,
                ("positionSkipped", "positionSuccess", "positionOutcome"),
                position_skipped,
                &position_result,
            );

            let (leverage_skipped, leverage_result) = self
                .run_rebalance_phase(usd_liability, btc_price_in_usd, &span)
                .await?;
            record_phase(
                &span,
                ("leverageSkipped", "leverageSuccess", "leverageOutcome"),
                leverage_skipped,
                &leverage_result,
            );

            let outcome = aggregate(
                position_skipped,
                position_result,
                leverage_skipped,
                leverage_result,
            );

            if let Ok(outcome) = &outcome {
                if let Err(err) = self.record_snapshot(usd_liability, btc_price_in_usd, outcome) {
                    warn!(error = %format!("{err:#}"), "Failed to record tick snapshot");
                }
            }

            outcome
        };

        inner.instrument(span).await
    }

    /// The wallet reports USD owed to users as a negative balance; the
    /// dealer hedges the inverted, non-negative liability.
    async fn fetch_usd_liability(&self) -> Result<Decimal> {
        let balance = self
            .wallet
            .get_usd_wallet_balance()
            .await
            .context("Liabilities is unavailable or NaN.")?;

        if !balance.is_finite() {
            bail!("Liabilities is unavailable or NaN.");
        }

        Decimal::from_f64(-balance).ok_or_else(|| anyhow!("Liabilities is unavailable or NaN."))
    }

    async fn run_position_phase(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
    ) -> (bool, Option<Result<PositionDelta>>) {
        if usd_liability < self.minimum_positive_liability_usd {
            debug!(
                %usd_liability,
                threshold = %self.minimum_positive_liability_usd,
                "Liability below hedging threshold, closing position"
            );
            // Fire-and-advance: the strategy owns its own idempotence and
            // the result is surfaced through telemetry only
            if let Err(err) = self.strategy.close_position().await {
                warn!(error = %format!("{err:#}"), "closePosition reported an error");
            }
            return (true, None);
        }

        let result = self
            .strategy
            .update_position(usd_liability, btc_price_in_usd)
            .await;
        (false, Some(result))
    }

    /// A pending transfer is uncommitted collateral the strategy cannot see
    /// yet; rebalancing over it would double-count, so the phase only runs
    /// on an empty in-flight set.
    async fn run_rebalance_phase(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
        span: &Span,
    ) -> Result<(bool, Option<Result<LeverageDelta>>)> {
        let pending = self.ledger.pending_count()?;
        span.record("pendingTransfers", pending);

        if pending > 0 {
            info!(
                pending_transfers = pending,
                "Rebalance deferred until in-flight transfers settle"
            );
            return Ok((true, None));
        }

        let deposit_address = match self.wallet.deposit_address().await {
            Ok(address) if !address.is_empty() => address,
            Ok(_) => bail!("WalletOnChainAddress is unavailable or invalid."),
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    "Failed to obtain wallet deposit address"
                );
                bail!("WalletOnChainAddress is unavailable or invalid.");
            }
        };

        let transfer_callbacks = TransferCallbacks::new(
            Arc::clone(&self.wallet),
            Arc::clone(&self.ledger),
            self.strategy.name().to_string(),
        );
        let result = self
            .strategy
            .update_leverage(
                usd_liability,
                btc_price_in_usd,
                &deposit_address,
                &transfer_callbacks,
                &transfer_callbacks,
            )
            .await;
        Ok((false, Some(result)))
    }

    fn record_snapshot(
        &self,
        usd_liability: Decimal,
        btc_price_usd: Decimal,
        outcome: &TickOutcome,
    ) -> Result<()> {
        self.ledger.record_tick_snapshot(&TickSnapshot {
            timestamp: Utc::now(),
            usd_liability,
            btc_price_usd,
            position_skipped: outcome.position_skipped,
            leverage_skipped: outcome.leverage_skipped,
            pending_transfers: self.ledger.pending_count()?,
        })
    }
}

fn record_phase<T: Serialize>(
    span: &Span,
    fields: (&str, &str, &str),
    skipped: bool,
    result: &Option<Result<T>>,
) {
    let (skipped_field, success_field, outcome_field) = fields;
    span.record(skipped_field, skipped);
    match result {
        Some(Ok(delta)) => {
            span.record(success_field, true);
            span.record(
                outcome_field,
                tracing::field::display(serde_json::to_string(delta).unwrap_or_default()),
            );
        }
        Some(Err(err)) => {
            span.record(success_field, false);
            span.record(outcome_field, tracing::field::display(format!("{err:#}")));
        }
        None => {
            span.record(success_field, skipped);
        }
    }
}

/// Collapse the two phase results into one tick result.
///
/// The tick succeeds iff each phase was skipped or succeeded. When both
/// phases fail, the position error is surfaced and the leverage error is
/// logged.
fn aggregate(
    position_skipped: bool,
    position_result: Option<Result<PositionDelta>>,
    leverage_skipped: bool,
    leverage_result: Option<Result<LeverageDelta>>,
) -> Result<TickOutcome> {
    let (position_delta, position_error) = split(position_result);
    let (leverage_delta, leverage_error) = split(leverage_result);

    let position_ok = position_skipped || position_delta.is_some();
    let leverage_ok = leverage_skipped || leverage_delta.is_some();

    if position_ok && leverage_ok {
        return Ok(TickOutcome {
            position_skipped,
            position_delta,
            leverage_skipped,
            leverage_delta,
        });
    }

    match (position_error, leverage_error) {
        (Some(position_err), Some(leverage_err)) => {
            error!(
                error = %format!("{leverage_err:#}"),
                "Leverage update also failed, surfacing the position error"
            );
            Err(position_err)
        }
        (Some(err), None) | (None, Some(err)) => Err(err),
        (None, None) => Err(anyhow!("Unknown error")),
    }
}

fn split<T>(result: Option<Result<T>>) -> (Option<T>, Option<anyhow::Error>) {
    match result {
        Some(Ok(value)) => (Some(value), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Transfer, TransferDirection};
    use crate::strategy::mock::LeverageAction;
    use crate::strategy::MockStrategy;
    use crate::wallet::MockWalletClient;
    use rust_decimal_macros::dec;

    struct TestDealer {
        dealer: Dealer,
        wallet: Arc<MockWalletClient>,
        strategy: Arc<MockStrategy>,
        ledger: Arc<TransferLedger>,
    }

    /// Dealer over mocks with a 5 USD liability threshold.
    fn test_dealer() -> TestDealer {
        let wallet = Arc::new(MockWalletClient::new());
        let strategy = Arc::new(MockStrategy::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());
        let dealer = Dealer::new(wallet.clone(), strategy.clone(), ledger.clone(), dec!(5));
        TestDealer {
            dealer,
            wallet,
            strategy,
            ledger,
        }
    }

    fn pending_deposit(address: &str, size_sats: u64) -> Transfer {
        Transfer {
            direction: TransferDirection::DepositToExchange,
            address: address.to_string(),
            size_sats,
            memo: "dealer:mock:deposit".to_string(),
            completed: false,
        }
    }

    #[tokio::test]
    async fn test_zero_liability_closes_position_and_rebalances() {
        let t = test_dealer();

        let outcome = t.dealer.tick().await.unwrap();

        assert!(outcome.position_skipped);
        assert!(outcome.position_delta.is_none());
        assert_eq!(t.strategy.close_position_calls().await, 1);
        assert!(t.strategy.update_position_calls().await.is_empty());

        // Nothing in flight, so the rebalance still runs
        assert!(!outcome.leverage_skipped);
        assert_eq!(t.strategy.update_leverage_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_liability_below_threshold_closes_position() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-2.0).await;

        let outcome = t.dealer.tick().await.unwrap();

        assert!(outcome.position_skipped);
        assert_eq!(t.strategy.close_position_calls().await, 1);
        assert!(t.strategy.update_position_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_in_credit_closes_position() {
        let t = test_dealer();
        // Positive wallet balance inverts to a negative liability
        t.wallet.set_usd_balance(3.0).await;

        let outcome = t.dealer.tick().await.unwrap();

        assert!(outcome.position_skipped);
        assert_eq!(t.strategy.close_position_calls().await, 1);
        assert!(t.strategy.update_position_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_liability_above_threshold_resizes_and_rebalances() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;

        let outcome = t.dealer.tick().await.unwrap();

        assert!(!outcome.position_skipped);
        assert_eq!(
            t.strategy.update_position_calls().await,
            vec![(dec!(1000), dec!(50000))]
        );
        assert_eq!(t.strategy.close_position_calls().await, 0);
        assert_eq!(
            outcome.position_delta,
            Some(PositionDelta {
                original_position: dec!(0),
                updated_position: dec!(0.02),
            })
        );

        assert!(!outcome.leverage_skipped);
        assert_eq!(t.wallet.address_fetches().await, 1);
        let leverage_calls = t.strategy.update_leverage_calls().await;
        assert_eq!(
            leverage_calls,
            vec![(dec!(1000), dec!(50000), "mock-onchain-address".to_string())]
        );
        assert!(outcome.leverage_delta.is_some());
    }

    #[tokio::test]
    async fn test_leverage_delta_reports_collateral_move() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy.set_target_leverage(dec!(3)).await;

        let outcome = t.dealer.tick().await.unwrap();

        assert_eq!(
            outcome.leverage_delta,
            Some(LeverageDelta {
                original_leverage: dec!(2),
                updated_leverage: dec!(3),
            })
        );
    }

    #[tokio::test]
    async fn test_pending_transfer_blocks_rebalance() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.ledger.insert(&pending_deposit("bc1-a", 1_000_000)).unwrap();

        let outcome = t.dealer.tick().await.unwrap();

        assert!(outcome.leverage_skipped);
        assert!(outcome.leverage_delta.is_none());
        assert!(t.strategy.update_leverage_calls().await.is_empty());
        assert_eq!(t.wallet.address_fetches().await, 0);

        // The position phase is unaffected by the gate
        assert_eq!(t.strategy.update_position_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_leverage_deposit_flows_through_callbacks() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy
            .set_leverage_action(LeverageAction::Deposit {
                size_btc: dec!(0.5),
                retries: 2,
            })
            .await;

        let outcome = t.dealer.tick().await.unwrap();
        assert!(!outcome.leverage_skipped);

        let payments = t.wallet.payments().await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].address, "mock-onchain-address");
        assert_eq!(payments[0].size_sats, 50_000_000);

        // The transfer is now in flight; next tick's rebalance is gated
        assert_eq!(t.ledger.pending_count().unwrap(), 1);
        let outcome = t.dealer.tick().await.unwrap();
        assert!(outcome.leverage_skipped);
    }

    #[tokio::test]
    async fn test_leverage_withdraw_records_without_payment() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy
            .set_leverage_action(LeverageAction::Withdraw {
                size_btc: dec!(0.25),
            })
            .await;

        t.dealer.tick().await.unwrap();

        assert!(t.wallet.payments().await.is_empty());
        let pending = t.ledger.pending_withdrawals().unwrap();
        assert_eq!(
            pending["mock-wallet-return-address"][0].size_sats,
            25_000_000
        );
    }

    #[tokio::test]
    async fn test_settlement_sweep_completes_deposit() {
        let t = test_dealer();
        t.ledger.insert(&pending_deposit("bc1-a", 1_000_000)).unwrap();
        t.strategy.mark_deposit_completed("bc1-a", 1_000_000).await;

        t.dealer.update_in_flight_transfers().await.unwrap();

        assert_eq!(t.ledger.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settlement_sweep_completes_withdrawal() {
        let t = test_dealer();
        t.ledger
            .insert(&Transfer {
                direction: TransferDirection::WithdrawFromExchange,
                address: "bc1-w".to_string(),
                size_sats: 2_000_000,
                memo: "dealer:mock:withdraw".to_string(),
                completed: false,
            })
            .unwrap();
        t.strategy
            .mark_withdrawal_completed("bc1-w", 2_000_000)
            .await;

        t.dealer.update_in_flight_transfers().await.unwrap();

        assert_eq!(t.ledger.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settlement_sweep_tolerates_per_row_failures() {
        let t = test_dealer();
        t.ledger.insert(&pending_deposit("bc1-a", 1_000_000)).unwrap();
        t.ledger.insert(&pending_deposit("bc1-b", 2_000_000)).unwrap();
        t.strategy.fail_settlement_checks("bc1-a").await;
        t.strategy.mark_deposit_completed("bc1-b", 2_000_000).await;

        // One failing row does not fail the sweep or block the other row
        t.dealer.update_in_flight_transfers().await.unwrap();

        let pending = t.ledger.pending_deposits().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key("bc1-a"));
    }

    #[tokio::test]
    async fn test_deposit_signal_cannot_complete_withdrawal() {
        let t = test_dealer();
        t.ledger
            .insert(&Transfer {
                direction: TransferDirection::WithdrawFromExchange,
                address: "bc1-x".to_string(),
                size_sats: 1_000_000,
                memo: "dealer:mock:withdraw".to_string(),
                completed: false,
            })
            .unwrap();
        // A settled deposit at the same address is a different transfer and
        // must not flip the withdrawal row
        t.strategy.mark_deposit_completed("bc1-x", 1_000_000).await;

        t.dealer.update_in_flight_transfers().await.unwrap();

        assert_eq!(t.ledger.pending_count().unwrap(), 1);
        assert!(!t.ledger.pending_withdrawals().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsettled_transfer_stays_pending() {
        let t = test_dealer();
        t.ledger.insert(&pending_deposit("bc1-a", 1_000_000)).unwrap();

        t.dealer.update_in_flight_transfers().await.unwrap();

        assert_eq!(t.ledger.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nan_liability_aborts_tick() {
        let t = test_dealer();
        t.wallet.set_usd_balance(f64::NAN).await;

        let err = t.dealer.tick().await.unwrap_err();

        assert!(format!("{err:#}").contains("Liabilities is unavailable or NaN."));
        assert!(t.strategy.update_position_calls().await.is_empty());
        assert_eq!(t.strategy.close_position_calls().await, 0);
        assert!(t.strategy.update_leverage_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_infinite_liability_aborts_tick() {
        let t = test_dealer();
        t.wallet.set_usd_balance(f64::NEG_INFINITY).await;

        let err = t.dealer.tick().await.unwrap_err();
        assert!(format!("{err:#}").contains("Liabilities is unavailable or NaN."));
    }

    #[tokio::test]
    async fn test_spot_price_failure_aborts_tick() {
        let t = test_dealer();
        t.strategy.set_spot_price_error("feed down").await;

        let err = t.dealer.tick().await.unwrap_err();

        assert!(err.to_string().contains("feed down"));
        assert!(t.strategy.update_position_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_deposit_address_aborts_tick() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.wallet.set_deposit_address(None).await;

        let err = t.dealer.tick().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "WalletOnChainAddress is unavailable or invalid."
        );
        assert!(t.strategy.update_leverage_calls().await.is_empty());
        // The position phase had already run
        assert_eq!(t.strategy.update_position_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_deposit_address_aborts_tick() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.wallet.set_deposit_address(Some("")).await;

        let err = t.dealer.tick().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "WalletOnChainAddress is unavailable or invalid."
        );
    }

    #[tokio::test]
    async fn test_position_error_does_not_stop_rebalance() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy.set_update_position_error("order rejected").await;

        let err = t.dealer.tick().await.unwrap_err();

        assert!(err.to_string().contains("order rejected"));
        // The rebalance still ran before aggregation surfaced the error
        assert_eq!(t.strategy.update_leverage_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_position_error_wins_over_leverage_error() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy.set_update_position_error("order rejected").await;
        t.strategy
            .set_update_leverage_error("margin transfer failed")
            .await;

        let err = t.dealer.tick().await.unwrap_err();
        assert!(err.to_string().contains("order rejected"));
    }

    #[tokio::test]
    async fn test_leverage_error_surfaced_when_position_succeeds() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy
            .set_update_leverage_error("margin transfer failed")
            .await;

        let err = t.dealer.tick().await.unwrap_err();
        assert!(err.to_string().contains("margin transfer failed"));
    }

    #[tokio::test]
    async fn test_close_position_error_is_ignored() {
        let t = test_dealer();
        t.strategy.set_close_position_error("already flat").await;

        let outcome = t.dealer.tick().await.unwrap();

        assert!(outcome.position_skipped);
        assert_eq!(t.strategy.close_position_calls().await, 1);
    }

    #[tokio::test]
    async fn test_successful_tick_records_snapshot() {
        let t = test_dealer();
        t.wallet.set_usd_balance(-1000.0).await;
        t.strategy.set_spot_price(dec!(40000)).await;

        t.dealer.tick().await.unwrap();

        let snapshots = t.ledger.recent_snapshots(10).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].usd_liability, dec!(1000));
        assert_eq!(snapshots[0].btc_price_usd, dec!(40000));
        assert!(!snapshots[0].position_skipped);
    }

    #[test]
    fn test_aggregate_collapses_unknown_state() {
        // A phase that neither skipped nor produced a result cannot name an
        // error; the aggregation still returns one
        let err = aggregate(false, None, true, None).unwrap_err();
        assert_eq!(err.to_string(), "Unknown error");
    }
}
