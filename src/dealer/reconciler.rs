//! Settlement sweep for in-flight on-chain transfers.

use super::Dealer;
use crate::ledger::{Transfer, TransferDirection};
use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info_span, warn, Instrument};

impl Dealer {
    /// Sweep pending transfers and mark the ones observed settled on both
    /// sides.
    ///
    /// Per-row failures (settlement check or completion write) are logged
    /// and skipped; the row is revisited on the next tick. The sweep only
    /// fails when the ledger reads themselves fail, since a missing pending
    /// set leaves nothing to gate rebalancing on.
    pub async fn update_in_flight_transfers(&self) -> Result<()> {
        let span = info_span!(
            "app.dealer.updateInFlightTransfer",
            activeStrategy = %self.strategy.name(),
        );

        async {
            let deposits = self.ledger.pending_deposits()?;
            let settled_deposits = self
                .sweep(deposits, TransferDirection::DepositToExchange)
                .await;

            let withdrawals = self.ledger.pending_withdrawals()?;
            let settled_withdrawals = self
                .sweep(withdrawals, TransferDirection::WithdrawFromExchange)
                .await;

            if settled_deposits + settled_withdrawals > 0 {
                debug!(
                    settled_deposits,
                    settled_withdrawals, "In-flight transfers settled"
                );
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn sweep(
        &self,
        pending: HashMap<String, Vec<Transfer>>,
        direction: TransferDirection,
    ) -> u64 {
        let mut settled = 0;

        for (address, transfers) in pending {
            for transfer in transfers {
                let check = match direction {
                    TransferDirection::DepositToExchange => {
                        self.strategy
                            .is_deposit_completed(&address, transfer.size_sats)
                            .await
                    }
                    TransferDirection::WithdrawFromExchange => {
                        self.strategy
                            .is_withdrawal_completed(&address, transfer.size_sats)
                            .await
                    }
                };

                match check {
                    Ok(true) => match self.ledger.completed(direction, &address) {
                        Ok(()) => {
                            settled += 1;
                            debug!(
                                direction = direction.as_str(),
                                %address,
                                size_sats = transfer.size_sats,
                                "Transfer settled"
                            );
                        }
                        Err(err) => {
                            // Revisited next tick; the completion bit stays
                            // unset until the write goes through
                            warn!(
                                direction = direction.as_str(),
                                %address,
                                error = %format!("{err:#}"),
                                "Failed to mark transfer completed"
                            );
                        }
                    },
                    Ok(false) => {
                        debug!(
                            direction = direction.as_str(),
                            %address,
                            size_sats = transfer.size_sats,
                            "Transfer still in flight"
                        );
                    }
                    Err(err) => {
                        warn!(
                            direction = direction.as_str(),
                            %address,
                            error = %format!("{err:#}"),
                            "Settlement check failed, skipping row"
                        );
                    }
                }
            }
        }

        settled
    }
}
