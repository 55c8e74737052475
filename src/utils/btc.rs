//! BTC and satoshi arithmetic for on-chain transfer sizing.

use anyhow::{ensure, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Number of decimal places in a BTC amount. One satoshi is 1e-8 BTC.
pub const BTC_PRECISION: u32 = 8;

/// Round a BTC amount to satoshi precision.
///
/// Applied before any conversion or halving so repeated division never
/// accumulates sub-satoshi dust.
pub fn round_btc(value: Decimal) -> Decimal {
    value.round_dp(BTC_PRECISION)
}

/// Convert a BTC amount to whole satoshis.
///
/// Fails for negative amounts and for amounts below one satoshi, both of
/// which would be invalid on-chain transfer sizes.
pub fn btc_to_sats(size_btc: Decimal) -> Result<u64> {
    let sats = (round_btc(size_btc) * dec!(100_000_000))
        .to_u64()
        .ok_or_else(|| anyhow::anyhow!("Invalid BTC amount for transfer: {size_btc}"))?;
    ensure!(sats >= 1, "Transfer size {size_btc} BTC is below one satoshi");
    Ok(sats)
}
