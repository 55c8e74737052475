//! # Dealer
//!
//! A reconciliation and hedging control loop that keeps a derivatives
//! position on an exchange synchronized with a USD liability held in a
//! custodial wallet, moving collateral on-chain to stay inside a target
//! leverage band.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `wallet`: Custodial wallet interface and implementations
//! - `strategy`: Hedging strategy interface and implementations
//! - `ledger`: SQLite-backed store of in-flight transfers and tick history
//! - `dealer`: The per-tick control loop (settle, position, rebalance)
//! - `utils`: Shared utilities and BTC/satoshi arithmetic

pub mod config;
pub mod dealer;
pub mod ledger;
pub mod strategy;
pub mod utils;
pub mod wallet;

pub use config::Config;
pub use dealer::{Dealer, TickOutcome};
