//! Mock wallet client for paper trading and tests.

use super::WalletClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A payment that went through the mock wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPayment {
    pub address: String,
    pub size_sats: u64,
    pub memo: String,
}

#[derive(Debug)]
struct MockWalletState {
    usd_balance: f64,
    btc_balance: f64,
    deposit_address: Option<String>,
    /// Errors to return from upcoming pay_onchain calls, consumed in order.
    pay_failures: VecDeque<String>,
    /// Every pay_onchain attempt, successful or not, in sats.
    payment_attempts: Vec<u64>,
    /// Payments that succeeded.
    payments: Vec<RecordedPayment>,
    address_fetches: u64,
}

impl Default for MockWalletState {
    fn default() -> Self {
        Self {
            usd_balance: 0.0,
            btc_balance: 1.0,
            deposit_address: Some("mock-onchain-address".to_string()),
            pay_failures: VecDeque::new(),
            payment_attempts: Vec::new(),
            payments: Vec::new(),
            address_fetches: 0,
        }
    }
}

/// Mock wallet that simulates the custodial wallet service.
pub struct MockWalletClient {
    state: Arc<RwLock<MockWalletState>>,
}

impl Default for MockWalletClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWalletClient {
    /// Create a mock wallet with a zero USD balance and 1 BTC.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockWalletState::default())),
        }
    }

    /// Set the reported USD balance. Negative means USD is owed to users.
    pub async fn set_usd_balance(&self, balance: f64) {
        self.state.write().await.usd_balance = balance;
    }

    /// Set the reported BTC balance.
    pub async fn set_btc_balance(&self, balance: f64) {
        self.state.write().await.btc_balance = balance;
    }

    /// Set or clear the on-chain deposit address.
    pub async fn set_deposit_address(&self, address: Option<&str>) {
        self.state.write().await.deposit_address = address.map(str::to_string);
    }

    /// Queue `count` pay_onchain failures with the given message.
    pub async fn fail_next_payments(&self, count: usize, message: &str) {
        let mut state = self.state.write().await;
        for _ in 0..count {
            state.pay_failures.push_back(message.to_string());
        }
    }

    /// All pay_onchain attempts so far, in sats, including failed ones.
    pub async fn payment_attempts(&self) -> Vec<u64> {
        self.state.read().await.payment_attempts.clone()
    }

    /// Successful payments so far.
    pub async fn payments(&self) -> Vec<RecordedPayment> {
        self.state.read().await.payments.clone()
    }

    /// How many times a deposit address was requested.
    pub async fn address_fetches(&self) -> u64 {
        self.state.read().await.address_fetches
    }
}

#[async_trait]
impl WalletClient for MockWalletClient {
    async fn get_usd_wallet_balance(&self) -> Result<f64> {
        Ok(self.state.read().await.usd_balance)
    }

    async fn get_btc_wallet_balance(&self) -> Result<f64> {
        Ok(self.state.read().await.btc_balance)
    }

    async fn deposit_address(&self) -> Result<String> {
        let mut state = self.state.write().await;
        state.address_fetches += 1;
        state
            .deposit_address
            .clone()
            .ok_or_else(|| anyhow!("Wallet has no on-chain address configured"))
    }

    async fn pay_onchain(&self, address: &str, size_sats: u64, memo: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.payment_attempts.push(size_sats);

        if let Some(message) = state.pay_failures.pop_front() {
            return Err(anyhow!("{message}"));
        }

        state.btc_balance -= size_sats as f64 / 100_000_000.0;
        state.payments.push(RecordedPayment {
            address: address.to_string(),
            size_sats,
            memo: memo.to_string(),
        });

        debug!(%address, size_sats, "Mock on-chain payment sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pay_records_attempts_and_successes() {
        let wallet = MockWalletClient::new();
        wallet.fail_next_payments(1, "tx cap exceeded").await;

        assert!(wallet.pay_onchain("bc1-a", 100, "memo").await.is_err());
        wallet.pay_onchain("bc1-a", 50, "memo").await.unwrap();

        assert_eq!(wallet.payment_attempts().await, vec![100, 50]);
        let payments = wallet.payments().await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].size_sats, 50);
    }

    #[tokio::test]
    async fn test_payment_reduces_btc_balance() {
        let wallet = MockWalletClient::new();
        wallet.set_btc_balance(2.0).await;

        wallet
            .pay_onchain("bc1-a", 50_000_000, "memo")
            .await
            .unwrap();

        let balance = wallet.get_btc_wallet_balance().await.unwrap();
        assert!((balance - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_deposit_address_can_be_cleared() {
        let wallet = MockWalletClient::new();
        assert!(wallet.deposit_address().await.is_ok());

        wallet.set_deposit_address(None).await;
        assert!(wallet.deposit_address().await.is_err());
        assert_eq!(wallet.address_fetches().await, 2);
    }
}
