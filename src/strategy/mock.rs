//! Mock hedging strategy for paper trading and tests.

use super::{DepositFunds, HedgingStrategy, LeverageDelta, PositionDelta, WithdrawFunds};
use crate::utils::btc::round_btc;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Collateral action the mock performs during a leverage update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeverageAction {
    /// Leverage already in band, touch nothing
    None,
    /// Add collateral from the wallet
    Deposit { size_btc: Decimal, retries: u32 },
    /// Drain collateral back to the wallet
    Withdraw { size_btc: Decimal },
}

#[derive(Debug)]
struct MockStrategyState {
    spot_price: Decimal,
    spot_price_error: Option<String>,
    position_btc: Decimal,
    leverage: Decimal,
    target_leverage: Decimal,
    leverage_action: LeverageAction,
    withdraw_address: String,
    update_position_error: Option<String>,
    close_position_error: Option<String>,
    update_leverage_error: Option<String>,
    update_position_calls: Vec<(Decimal, Decimal)>,
    close_position_calls: u64,
    update_leverage_calls: Vec<(Decimal, Decimal, String)>,
    completed_deposits: HashSet<(String, u64)>,
    completed_withdrawals: HashSet<(String, u64)>,
    /// Addresses whose settlement checks fail.
    settlement_check_failures: HashSet<String>,
}

impl Default for MockStrategyState {
    fn default() -> Self {
        Self {
            spot_price: dec!(50000),
            spot_price_error: None,
            position_btc: Decimal::ZERO,
            leverage: dec!(2),
            target_leverage: dec!(2),
            leverage_action: LeverageAction::None,
            withdraw_address: "mock-wallet-return-address".to_string(),
            update_position_error: None,
            close_position_error: None,
            update_leverage_error: None,
            update_position_calls: Vec::new(),
            close_position_calls: 0,
            update_leverage_calls: Vec::new(),
            completed_deposits: HashSet::new(),
            completed_withdrawals: HashSet::new(),
            settlement_check_failures: HashSet::new(),
        }
    }
}

/// Mock strategy that simulates an exchange-side hedge.
///
/// The simulated position is `usd_liability / btc_price` BTC short; leverage
/// updates move toward a configurable target and optionally exercise the
/// transfer callbacks.
pub struct MockStrategy {
    state: Arc<RwLock<MockStrategyState>>,
}

impl Default for MockStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStrategy {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockStrategyState::default())),
        }
    }

    pub async fn set_spot_price(&self, price: Decimal) {
        self.state.write().await.spot_price = price;
    }

    pub async fn set_spot_price_error(&self, message: &str) {
        self.state.write().await.spot_price_error = Some(message.to_string());
    }

    pub async fn set_update_position_error(&self, message: &str) {
        self.state.write().await.update_position_error = Some(message.to_string());
    }

    pub async fn set_close_position_error(&self, message: &str) {
        self.state.write().await.close_position_error = Some(message.to_string());
    }

    pub async fn set_update_leverage_error(&self, message: &str) {
        self.state.write().await.update_leverage_error = Some(message.to_string());
    }

    /// Choose what the next leverage updates do with the callbacks.
    pub async fn set_leverage_action(&self, action: LeverageAction) {
        self.state.write().await.leverage_action = action;
    }

    pub async fn set_target_leverage(&self, target: Decimal) {
        self.state.write().await.target_leverage = target;
    }

    /// Mark a deposit as observed settled on the exchange.
    pub async fn mark_deposit_completed(&self, address: &str, size_sats: u64) {
        self.state
            .write()
            .await
            .completed_deposits
            .insert((address.to_string(), size_sats));
    }

    /// Mark a withdrawal as observed settled in the wallet.
    pub async fn mark_withdrawal_completed(&self, address: &str, size_sats: u64) {
        self.state
            .write()
            .await
            .completed_withdrawals
            .insert((address.to_string(), size_sats));
    }

    /// Make settlement checks for `address` fail.
    pub async fn fail_settlement_checks(&self, address: &str) {
        self.state
            .write()
            .await
            .settlement_check_failures
            .insert(address.to_string());
    }

    pub async fn position_btc(&self) -> Decimal {
        self.state.read().await.position_btc
    }

    pub async fn update_position_calls(&self) -> Vec<(Decimal, Decimal)> {
        self.state.read().await.update_position_calls.clone()
    }

    pub async fn close_position_calls(&self) -> u64 {
        self.state.read().await.close_position_calls
    }

    pub async fn update_leverage_calls(&self) -> Vec<(Decimal, Decimal, String)> {
        self.state.read().await.update_leverage_calls.clone()
    }
}

#[async_trait]
impl HedgingStrategy for MockStrategy {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_btc_spot_price_in_usd(&self) -> Result<Decimal> {
        let state = self.state.read().await;
        if let Some(message) = &state.spot_price_error {
            return Err(anyhow!("{message}"));
        }
        Ok(state.spot_price)
    }

    async fn update_position(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
    ) -> Result<PositionDelta> {
        let mut state = self.state.write().await;
        state
            .update_position_calls
            .push((usd_liability, btc_price_in_usd));

        if let Some(message) = &state.update_position_error {
            return Err(anyhow!("{message}"));
        }

        let original = state.position_btc;
        state.position_btc = round_btc(usd_liability / btc_price_in_usd);

        debug!(
            original = %original,
            updated = %state.position_btc,
            "Mock position resized"
        );
        Ok(PositionDelta {
            original_position: original,
            updated_position: state.position_btc,
        })
    }

    async fn close_position(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.close_position_calls += 1;

        if let Some(message) = &state.close_position_error {
            return Err(anyhow!("{message}"));
        }

        state.position_btc = Decimal::ZERO;
        Ok(())
    }

    async fn update_leverage(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
        deposit_address: &str,
        withdraw: &dyn WithdrawFunds,
        deposit: &dyn DepositFunds,
    ) -> Result<LeverageDelta> {
        let (action, withdraw_address) = {
            let mut state = self.state.write().await;
            state.update_leverage_calls.push((
                usd_liability,
                btc_price_in_usd,
                deposit_address.to_string(),
            ));

            if let Some(message) = &state.update_leverage_error {
                return Err(anyhow!("{message}"));
            }
            (state.leverage_action.clone(), state.withdraw_address.clone())
        };

        match action {
            LeverageAction::None => {}
            LeverageAction::Deposit { size_btc, retries } => {
                deposit.deposit(deposit_address, size_btc, retries).await?;
            }
            LeverageAction::Withdraw { size_btc } => {
                withdraw.withdraw(&withdraw_address, size_btc).await?;
            }
        }

        let mut state = self.state.write().await;
        let original = state.leverage;
        state.leverage = state.target_leverage;
        Ok(LeverageDelta {
            original_leverage: original,
            updated_leverage: state.leverage,
        })
    }

    async fn is_deposit_completed(&self, address: &str, size_sats: u64) -> Result<bool> {
        let state = self.state.read().await;
        if state.settlement_check_failures.contains(address) {
            return Err(anyhow!("Settlement lookup failed for {address}"));
        }
        Ok(state
            .completed_deposits
            .contains(&(address.to_string(), size_sats)))
    }

    async fn is_withdrawal_completed(&self, address: &str, size_sats: u64) -> Result<bool> {
        let state = self.state.read().await;
        if state.settlement_check_failures.contains(address) {
            return Err(anyhow!("Settlement lookup failed for {address}"));
        }
        Ok(state
            .completed_withdrawals
            .contains(&(address.to_string(), size_sats)))
    }
}
