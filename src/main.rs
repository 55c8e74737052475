use anyhow::Result;
use dealer::ledger::TransferLedger;
use dealer::{strategy, wallet, Config, Dealer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Single-crate binary: RUST_LOG overrides, plain info-level output
    // otherwise, no target prefixes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting dealer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    config.validate()?;
    info!(
        strategy = %config.hedging.active_strategy,
        wallet = %config.wallet.provider,
        threshold_usd = %config.hedging.minimum_positive_liability_usd,
        "Configuration loaded"
    );

    let wallet = wallet::from_name(&config.wallet.provider)?;
    let hedging_strategy = strategy::from_name(&config.hedging.active_strategy)?;
    let ledger = Arc::new(TransferLedger::new(&config.ledger.db_path)?);

    let usd_balance = wallet.get_usd_wallet_balance().await?;
    let btc_balance = wallet.get_btc_wallet_balance().await?;
    info!(usd_balance, btc_balance, "Wallet reachable");

    let dealer = Dealer::new(
        wallet,
        hedging_strategy,
        Arc::clone(&ledger),
        config.hedging.minimum_positive_liability_usd,
    );

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.execution.tick_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match dealer.tick().await {
                    Ok(outcome) => info!(
                        position_skipped = outcome.position_skipped,
                        leverage_skipped = outcome.leverage_skipped,
                        "Tick completed"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "Tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c, stopping the control loop");
                break;
            }
        }
    }

    Ok(())
}
