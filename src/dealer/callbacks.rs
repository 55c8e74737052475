//! Transfer callbacks handed to the strategy during a leverage update.

use crate::ledger::{Transfer, TransferDirection, TransferLedger};
use crate::strategy::{DepositFunds, WithdrawFunds};
use crate::utils::btc::{btc_to_sats, round_btc};
use crate::wallet::WalletClient;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Executes and records the transfers a strategy initiates while
/// rebalancing.
///
/// Bound to one dealer instance's wallet and ledger. Every failure is
/// returned as an error; nothing escapes the callback boundary.
pub struct TransferCallbacks {
    wallet: Arc<dyn WalletClient>,
    ledger: Arc<TransferLedger>,
    strategy_name: String,
}

impl TransferCallbacks {
    pub(crate) fn new(
        wallet: Arc<dyn WalletClient>,
        ledger: Arc<TransferLedger>,
        strategy_name: String,
    ) -> Self {
        Self {
            wallet,
            ledger,
            strategy_name,
        }
    }

    fn memo(&self, kind: &str) -> String {
        format!("dealer:{}:{}", self.strategy_name, kind)
    }
}

#[async_trait]
impl DepositFunds for TransferCallbacks {
    /// Pay `size_btc` on-chain to the exchange and record the in-flight
    /// deposit.
    ///
    /// Wallets and exchanges impose per-transaction caps, so each failed
    /// payment is retried at half the size until `retries` runs out. At
    /// most `retries + 1` payments are attempted.
    async fn deposit(&self, address: &str, size_btc: Decimal, retries: u32) -> Result<()> {
        let memo = self.memo("deposit");
        let mut size_btc = round_btc(size_btc);
        let mut retries = retries;

        loop {
            let size_sats = btc_to_sats(size_btc)?;

            match self.wallet.pay_onchain(address, size_sats, &memo).await {
                Ok(()) => {
                    info!(%address, size_sats, "On-chain deposit sent");

                    let transfer = Transfer {
                        direction: TransferDirection::DepositToExchange,
                        address: address.to_string(),
                        size_sats,
                        memo,
                        completed: false,
                    };
                    return match self.ledger.insert(&transfer) {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            // Money-safety incident: the payment is on-chain
                            // but the ledger holds no row for it, so the
                            // settlement sweep will never complete it.
                            error!(
                                %address,
                                size_sats,
                                error = %format!("{err:#}"),
                                "On-chain deposit sent but not recorded in the ledger"
                            );
                            Err(err)
                        }
                    };
                }
                Err(err) if retries > 0 => {
                    warn!(
                        %address,
                        %size_btc,
                        retries_left = retries,
                        error = %format!("{err:#}"),
                        "On-chain payment failed, retrying at half size"
                    );
                    retries -= 1;
                    size_btc = round_btc(size_btc / dec!(2));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl WithdrawFunds for TransferCallbacks {
    /// Record a withdrawal the strategy initiated on the exchange.
    ///
    /// The exchange moves the funds; this only records the expectation so
    /// the settlement sweep can observe it arriving in the wallet.
    async fn withdraw(&self, address: &str, size_btc: Decimal) -> Result<()> {
        let size_sats = btc_to_sats(size_btc)?;

        let transfer = Transfer {
            direction: TransferDirection::WithdrawFromExchange,
            address: address.to_string(),
            size_sats,
            memo: self.memo("withdraw"),
            completed: false,
        };
        self.ledger.insert(&transfer)?;

        debug!(%address, size_sats, "Exchange withdrawal recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::MockWalletClient;

    fn callbacks(wallet: &Arc<MockWalletClient>, ledger: &Arc<TransferLedger>) -> TransferCallbacks {
        TransferCallbacks::new(wallet.clone(), ledger.clone(), "mock".to_string())
    }

    #[tokio::test]
    async fn test_deposit_pays_and_records() {
        let wallet = Arc::new(MockWalletClient::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());

        callbacks(&wallet, &ledger)
            .deposit("bc1-exchange", dec!(0.4), 2)
            .await
            .unwrap();

        let payments = wallet.payments().await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].size_sats, 40_000_000);
        assert_eq!(payments[0].memo, "dealer:mock:deposit");

        let pending = ledger.pending_deposits().unwrap();
        assert_eq!(pending["bc1-exchange"][0].size_sats, 40_000_000);
    }

    #[tokio::test]
    async fn test_deposit_halves_size_on_each_retry() {
        let wallet = Arc::new(MockWalletClient::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());
        wallet.fail_next_payments(2, "per-tx cap exceeded").await;

        callbacks(&wallet, &ledger)
            .deposit("bc1-exchange", dec!(0.4), 2)
            .await
            .unwrap();

        assert_eq!(
            wallet.payment_attempts().await,
            vec![40_000_000, 20_000_000, 10_000_000]
        );

        // Only the size that went through is recorded
        let pending = ledger.pending_deposits().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["bc1-exchange"][0].size_sats, 10_000_000);
    }

    #[tokio::test]
    async fn test_deposit_gives_up_after_three_attempts() {
        let wallet = Arc::new(MockWalletClient::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());
        wallet.fail_next_payments(3, "per-tx cap exceeded").await;

        let err = callbacks(&wallet, &ledger)
            .deposit("bc1-exchange", dec!(0.4), 2)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("per-tx cap exceeded"));
        assert_eq!(wallet.payment_attempts().await.len(), 3);
        assert_eq!(ledger.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deposit_rejects_dust_before_paying() {
        let wallet = Arc::new(MockWalletClient::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());

        let result = callbacks(&wallet, &ledger)
            .deposit("bc1-exchange", dec!(0.000000001), 2)
            .await;

        assert!(result.is_err());
        assert!(wallet.payment_attempts().await.is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_records_without_paying() {
        let wallet = Arc::new(MockWalletClient::new());
        let ledger = Arc::new(TransferLedger::in_memory().unwrap());

        callbacks(&wallet, &ledger)
            .withdraw("bc1-wallet", dec!(0.25))
            .await
            .unwrap();

        assert!(wallet.payment_attempts().await.is_empty());

        let pending = ledger.pending_withdrawals().unwrap();
        assert_eq!(pending["bc1-wallet"][0].size_sats, 25_000_000);
        assert_eq!(pending["bc1-wallet"][0].memo, "dealer:mock:withdraw");
    }
}
