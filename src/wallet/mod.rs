//! Custodial wallet integrations.
//!
//! The dealer only needs four operations from the wallet service: the two
//! balance queries, deposit-address issuance, and on-chain payment. Concrete
//! wallet backends implement [`WalletClient`] and register a name in
//! [`from_name`].

pub mod mock;

pub use mock::MockWalletClient;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations the dealer requires from the custodial wallet service.
#[async_trait]
pub trait WalletClient: Send + Sync {
    /// Current USD balance. Negative when USD is owed to users.
    ///
    /// The value comes straight off the wire and may be non-finite; callers
    /// validate before acting on it.
    async fn get_usd_wallet_balance(&self) -> Result<f64>;

    /// Current BTC balance of the wallet.
    async fn get_btc_wallet_balance(&self) -> Result<f64>;

    /// A fresh or reusable on-chain deposit address for this wallet.
    async fn deposit_address(&self) -> Result<String>;

    /// Send `size_sats` on-chain to `address`, tagged with `memo`.
    async fn pay_onchain(&self, address: &str, size_sats: u64, memo: &str) -> Result<()>;
}

/// Resolve a wallet implementation from its configured name.
pub fn from_name(name: &str) -> Result<Arc<dyn WalletClient>> {
    match name {
        "mock" => Ok(Arc::new(MockWalletClient::new())),
        other => bail!("Unknown wallet provider: {other}"),
    }
}
