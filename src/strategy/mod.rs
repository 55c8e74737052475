//! Hedging strategy interfaces.
//!
//! A strategy owns everything exchange-specific: the derivative position
//! math, the collateral/leverage math, and settlement detection for on-chain
//! transfers. The dealer core drives a strategy purely through
//! [`HedgingStrategy`]; during a leverage update the strategy reaches back
//! into the core through the [`DepositFunds`] and [`WithdrawFunds`]
//! capabilities it is handed.

pub mod mock;

pub use mock::MockStrategy;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Position change reported by a strategy after a position update.
///
/// Opaque to the core: produced by the strategy, serialized verbatim into
/// telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PositionDelta {
    pub original_position: Decimal,
    pub updated_position: Decimal,
}

/// Collateral change reported by a strategy after a leverage update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeverageDelta {
    pub original_leverage: Decimal,
    pub updated_leverage: Decimal,
}

/// Capability to move wallet funds on-chain onto the exchange.
///
/// Handed to the strategy for the duration of one leverage update. The
/// implementation executes the payment and records the in-flight transfer.
#[async_trait]
pub trait DepositFunds: Send + Sync {
    async fn deposit(&self, address: &str, size_btc: Decimal, retries: u32) -> Result<()>;
}

/// Capability to record an exchange-side withdrawal the strategy initiated.
///
/// No on-chain action is taken; the implementation only records the
/// expectation so the settlement sweep can observe it landing.
#[async_trait]
pub trait WithdrawFunds: Send + Sync {
    async fn withdraw(&self, address: &str, size_btc: Decimal) -> Result<()>;
}

/// Operations the dealer requires from a hedging strategy.
#[async_trait]
pub trait HedgingStrategy: Send + Sync {
    /// Name this strategy was registered under.
    fn name(&self) -> &str;

    /// Current BTC spot price in USD.
    async fn get_btc_spot_price_in_usd(&self) -> Result<Decimal>;

    /// Resize the derivative position to neutralize `usd_liability`.
    async fn update_position(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
    ) -> Result<PositionDelta>;

    /// Close the derivative position. Must be idempotent.
    async fn close_position(&self) -> Result<()>;

    /// Move collateral toward the target leverage band.
    ///
    /// The strategy decides whether to call `withdraw` (drain collateral to
    /// the wallet), `deposit` (add collateral from the wallet via
    /// `deposit_address`), or neither.
    async fn update_leverage(
        &self,
        usd_liability: Decimal,
        btc_price_in_usd: Decimal,
        deposit_address: &str,
        withdraw: &dyn WithdrawFunds,
        deposit: &dyn DepositFunds,
    ) -> Result<LeverageDelta>;

    /// Whether a deposit of `size_sats` to `address` has settled on the exchange.
    async fn is_deposit_completed(&self, address: &str, size_sats: u64) -> Result<bool>;

    /// Whether a withdrawal of `size_sats` to `address` has settled in the wallet.
    async fn is_withdrawal_completed(&self, address: &str, size_sats: u64) -> Result<bool>;
}

/// Resolve a strategy implementation from its configured name.
pub fn from_name(name: &str) -> Result<Arc<dyn HedgingStrategy>> {
    match name {
        "mock" => Ok(Arc::new(MockStrategy::new())),
        other => bail!("Unknown hedging strategy: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_resolves_mock() {
        let strategy = from_name("mock").unwrap();
        assert_eq!(strategy.name(), "mock");
    }

    #[test]
    fn test_from_name_rejects_unknown() {
        assert!(from_name("kumquat-perp").is_err());
    }

    #[test]
    fn test_deltas_serialize_for_telemetry() {
        use rust_decimal_macros::dec;

        let delta = PositionDelta {
            original_position: dec!(0),
            updated_position: dec!(0.02),
        };
        let json = serde_json::to_string(&delta).unwrap();
        assert!(json.contains("\"updated_position\":\"0.02\""));
    }
}
