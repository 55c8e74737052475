//! Configuration management for the dealer.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hedging parameters and strategy selection
    pub hedging: HedgingConfig,
    /// Wallet service selection
    pub wallet: WalletConfig,
    /// Transfer ledger storage
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Control loop scheduling
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgingConfig {
    /// Strategy implementation selected by name. Required.
    pub active_strategy: String,
    /// Liabilities below this threshold close the position instead of resizing it
    #[serde(default = "default_minimum_positive_liability_usd")]
    pub minimum_positive_liability_usd: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Wallet implementation selected by name. Required.
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Path to the SQLite database holding transfers and tick history
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds between control loop ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_minimum_positive_liability_usd() -> Decimal {
    Decimal::ONE // 1 USD
}

fn default_db_path() -> String {
    "dealer.db".to_string()
}

fn default_tick_interval() -> u64 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    ///
    /// Missing strategy or wallet selectors fail the load; there is no
    /// usable default for either.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("dealer").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("DEALER"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.hedging.active_strategy.is_empty(),
            "hedging.active_strategy must name a strategy"
        );

        anyhow::ensure!(
            !self.wallet.provider.is_empty(),
            "wallet.provider must name a wallet implementation"
        );

        anyhow::ensure!(
            self.hedging.minimum_positive_liability_usd >= Decimal::ZERO,
            "minimum_positive_liability_usd must be non-negative"
        );

        anyhow::ensure!(
            self.execution.tick_interval_secs >= 1,
            "tick_interval_secs must be at least 1"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hedging: HedgingConfig {
                active_strategy: "mock".to_string(),
                minimum_positive_liability_usd: default_minimum_positive_liability_usd(),
            },
            wallet: WalletConfig {
                provider: "mock".to_string(),
            },
            ledger: LedgerConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}
