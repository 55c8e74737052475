//! SQLite-backed ledger of in-flight on-chain transfers.
//!
//! The ledger is the only state carried between ticks:
//! - Pending transfers gate rebalancing and drive the settlement sweep
//! - Completed transfers are retained indefinitely for audit
//! - Tick snapshots record per-tick metrics for operator review

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Direction of an on-chain transfer relative to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Wallet pays on-chain into the exchange's deposit address
    DepositToExchange,
    /// Exchange pays on-chain back to the wallet
    WithdrawFromExchange,
}

impl TransferDirection {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::DepositToExchange => "deposit",
            TransferDirection::WithdrawFromExchange => "withdraw",
        }
    }
}

/// An in-flight on-chain transfer recorded by the dealer.
///
/// Direction and size are immutable after insertion; only the `completed`
/// flag changes, and only from false to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub address: String,
    pub size_sats: u64,
    pub memo: String,
    pub completed: bool,
}

/// Per-tick metrics snapshot.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub timestamp: DateTime<Utc>,
    pub usd_liability: Decimal,
    pub btc_price_usd: Decimal,
    pub position_skipped: bool,
    pub leverage_skipped: bool,
    pub pending_transfers: u64,
}

/// SQLite-backed transfer ledger.
pub struct TransferLedger {
    conn: Mutex<Connection>,
}

impl TransferLedger {
    /// Open (or create) the ledger database at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open ledger at {:?}", db_path.as_ref()))?;

        Self::init_schema(&conn)?;

        info!("Transfer ledger opened at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory ledger. Used by paper mode and tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- In-flight and settled on-chain transfers
            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                direction TEXT NOT NULL CHECK (direction IN ('deposit', 'withdraw')),
                address TEXT NOT NULL,
                size_sats INTEGER NOT NULL CHECK (size_sats >= 1),
                memo TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            -- Completion is keyed by address, so an address may appear at
            -- most once among pending rows, whatever their direction
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transfers_pending_address
                ON transfers(address) WHERE completed = 0;
            CREATE INDEX IF NOT EXISTS idx_transfers_completed ON transfers(completed);

            -- Per-tick metrics history
            CREATE TABLE IF NOT EXISTS tick_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                usd_liability TEXT NOT NULL,
                btc_price_usd TEXT NOT NULL,
                position_skipped INTEGER NOT NULL,
                leverage_skipped INTEGER NOT NULL,
                pending_transfers INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON tick_snapshots(timestamp);
            "#,
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Ledger connection is poisoned"))
    }

    /// Record a new transfer.
    pub fn insert(&self, transfer: &Transfer) -> Result<()> {
        anyhow::ensure!(
            transfer.size_sats >= 1,
            "Transfer size must be at least one satoshi"
        );

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO transfers (direction, address, size_sats, memo, completed, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                transfer.direction.as_str(),
                transfer.address,
                transfer.size_sats as i64,
                transfer.memo,
                transfer.completed as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| {
            format!(
                "Failed to record {} transfer for {}",
                transfer.direction.as_str(),
                transfer.address
            )
        })?;

        debug!(
            direction = transfer.direction.as_str(),
            address = %transfer.address,
            size_sats = transfer.size_sats,
            "Transfer recorded"
        );
        Ok(())
    }

    /// Pending deposits to the exchange, grouped by address.
    pub fn pending_deposits(&self) -> Result<HashMap<String, Vec<Transfer>>> {
        self.pending_by_direction(TransferDirection::DepositToExchange)
    }

    /// Pending withdrawals from the exchange, grouped by address.
    pub fn pending_withdrawals(&self) -> Result<HashMap<String, Vec<Transfer>>> {
        self.pending_by_direction(TransferDirection::WithdrawFromExchange)
    }

    fn pending_by_direction(
        &self,
        direction: TransferDirection,
    ) -> Result<HashMap<String, Vec<Transfer>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT address, size_sats, memo
            FROM transfers
            WHERE direction = ?1 AND completed = 0
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(params![direction.as_str()], |row| {
            Ok(Transfer {
                direction,
                address: row.get(0)?,
                size_sats: row.get::<_, i64>(1)? as u64,
                memo: row.get(2)?,
                completed: false,
            })
        })?;

        let mut pending: HashMap<String, Vec<Transfer>> = HashMap::new();
        for row in rows {
            let transfer = row?;
            pending
                .entry(transfer.address.clone())
                .or_default()
                .push(transfer);
        }

        Ok(pending)
    }

    /// Mark the pending transfer at `address` in `direction` as completed.
    ///
    /// Idempotent: completing an address with no pending row in that
    /// direction is a no-op. The direction filter keeps a settled deposit
    /// from ever flipping an unconfirmed withdrawal row, and vice versa.
    pub fn completed(&self, direction: TransferDirection, address: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE transfers SET completed = 1 WHERE direction = ?1 AND address = ?2 AND completed = 0",
                params![direction.as_str(), address],
            )
            .with_context(|| format!("Failed to complete transfer at {address}"))?;

        if updated == 0 {
            debug!(direction = direction.as_str(), %address, "No pending transfer to complete");
        } else {
            debug!(direction = direction.as_str(), %address, rows = updated, "Transfer completed");
        }
        Ok(())
    }

    /// Number of transfers still in flight, across both directions.
    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transfers WHERE completed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record a per-tick metrics snapshot.
    pub fn record_tick_snapshot(&self, snapshot: &TickSnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO tick_snapshots (timestamp, usd_liability, btc_price_usd,
                                        position_skipped, leverage_skipped, pending_transfers)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot.timestamp.to_rfc3339(),
                snapshot.usd_liability.to_string(),
                snapshot.btc_price_usd.to_string(),
                snapshot.position_skipped as i64,
                snapshot.leverage_skipped as i64,
                snapshot.pending_transfers as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent tick snapshots, newest first.
    pub fn recent_snapshots(&self, limit: usize) -> Result<Vec<TickSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, usd_liability, btc_price_usd,
                   position_skipped, leverage_skipped, pending_transfers
            FROM tick_snapshots
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let snapshots: Vec<TickSnapshot> = stmt
            .query_map([limit], |row| {
                Ok(TickSnapshot {
                    timestamp: DateTime::parse_from_rfc3339(&row.get::<_, String>(0)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    usd_liability: Decimal::from_str(&row.get::<_, String>(1)?)
                        .unwrap_or_default(),
                    btc_price_usd: Decimal::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    position_skipped: row.get::<_, i64>(3)? != 0,
                    leverage_skipped: row.get::<_, i64>(4)? != 0,
                    pending_transfers: row.get::<_, i64>(5)? as u64,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(snapshots)
    }
}
