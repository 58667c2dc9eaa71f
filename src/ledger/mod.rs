//! Trade ledger: the append-only record of every realized fill.
//!
//! The ledger is a JSONL file, one record per line, fsynced on every
//! append. It is the authoritative history: a close is appended *before*
//! the position leaves the state store, so a crash between the two leaves
//! a ledger-closed position for the reconciler to finish cleaning up.
//!
//! A companion SQLite store mirrors the ledger for ad-hoc inspection; it
//! is derived data and its failures never block trading.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::exchange::OrderSide;
use crate::state::Position;

/// Why a position was (or is being) closed. Doubles as the strategy tag
/// learning buckets key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    RecycleProfit,
    AlphaDecay,
    /// Fill discovered through history sync rather than an active close
    HistorySync,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::RecycleProfit => "recycle_profit",
            CloseReason::AlphaDecay => "alpha_decay",
            CloseReason::HistorySync => "history_sync",
        }
    }

    /// Exit priority when several closes fire in one cycle: stop-losses
    /// always flush first.
    pub fn priority(&self) -> u8 {
        match self {
            CloseReason::StopLoss => 0,
            CloseReason::TakeProfit => 1,
            CloseReason::RecycleProfit => 2,
            CloseReason::AlphaDecay => 3,
            CloseReason::HistorySync => 4,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "take_profit" => Ok(CloseReason::TakeProfit),
            "stop_loss" => Ok(CloseReason::StopLoss),
            "recycle_profit" => Ok(CloseReason::RecycleProfit),
            "alpha_decay" => Ok(CloseReason::AlphaDecay),
            "history_sync" => Ok(CloseReason::HistorySync),
            other => Err(format!("unknown close reason {other:?}")),
        }
    }
}

/// Where a recorded fill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    ActiveTrade,
    HistorySync,
}

/// One immutable realized trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique id; learning-memory dedupe key
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Exit reason for sells; `None` for entries
    pub reason: Option<CloseReason>,
    /// Realized PnL net of fees; sells only
    pub realized_pnl: Option<Decimal>,
    pub fill_source: FillSource,
}

/// Append-only durable trade log.
pub struct TradeLedger {
    path: PathBuf,
    file: File,
    seq: AtomicU64,
}

impl TradeLedger {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open trade ledger {path:?}"))?;

        info!(path = %path.display(), "Trade ledger opened");
        Ok(Self {
            path,
            file,
            seq: AtomicU64::new(0),
        })
    }

    /// Mint a process-unique trade id.
    pub fn next_id(&self, symbol: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "TRD-{}-{}-{}",
            Utc::now().timestamp_millis(),
            symbol.replace('-', ""),
            seq
        )
    }

    /// Append one record and fsync before returning.
    pub fn append(&mut self, record: &TradeRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize trade")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .context("Failed to append trade")?;
        self.file.sync_data().context("Failed to fsync ledger")?;
        debug!(id = %record.id, symbol = %record.symbol, side = ?record.side, "Trade appended");
        Ok(())
    }

    /// Read the whole ledger, oldest first. Corrupt lines (torn writes
    /// from a crash) are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<TradeRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open ledger for read"),
        };

        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(lineno, error = %e, "Skipping corrupt ledger line"),
            }
        }
        Ok(records)
    }

    /// Reconstruct the open entry for a symbol by replaying fills FIFO.
    ///
    /// Returns the weighted average price and remaining quantity of the
    /// buys that have not been consumed by later sells, or `None` when the
    /// ledger nets out flat for the symbol.
    pub fn reconstruct_entry(&self, symbol: &str) -> Result<Option<(Decimal, Decimal)>> {
        let mut lots: VecDeque<(Decimal, Decimal)> = VecDeque::new(); // (price, qty)

        for record in self.load_all()? {
            if record.symbol != symbol {
                continue;
            }
            match record.side {
                OrderSide::Buy => lots.push_back((record.price, record.quantity)),
                OrderSide::Sell => {
                    let mut remaining = record.quantity;
                    while remaining > Decimal::ZERO {
                        let Some(front) = lots.front_mut() else {
                            break;
                        };
                        if front.1 > remaining {
                            front.1 -= remaining;
                            remaining = Decimal::ZERO;
                        } else {
                            remaining -= front.1;
                            lots.pop_front();
                        }
                    }
                }
            }
        }

        let total_qty: Decimal = lots.iter().map(|(_, q)| *q).sum();
        if total_qty <= Decimal::ZERO {
            return Ok(None);
        }
        let weighted: Decimal = lots.iter().map(|(p, q)| p * q).sum::<Decimal>() / total_qty;
        Ok(Some((weighted, total_qty)))
    }

    /// Ids of all recorded trades (learning-memory replay).
    pub fn all_ids(&self) -> Result<Vec<String>> {
        Ok(self.load_all()?.into_iter().map(|r| r.id).collect())
    }
}

/// Derived SQLite mirror of positions and trades.
pub struct TradeStore {
    conn: Connection,
}

impl TradeStore {
    /// Open (and migrate) the companion database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open trade db at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;
        info!("Trade store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fees TEXT NOT NULL,
                reason TEXT,
                realized_pnl TEXT,
                fill_source TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);

            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                regime TEXT NOT NULL,
                strategy TEXT NOT NULL,
                opportunity_score REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS system_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Mirror one trade record (idempotent by id).
    pub fn record_trade(&self, record: &TradeRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO trades
                (id, timestamp, symbol, side, quantity, price, fees, reason, realized_pnl, fill_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id,
                record.timestamp.to_rfc3339(),
                record.symbol,
                record.side.to_string(),
                record.quantity.to_string(),
                record.price.to_string(),
                record.fees.to_string(),
                record.reason.map(|r| r.as_str()),
                record.realized_pnl.map(|p| p.to_string()),
                match record.fill_source {
                    FillSource::ActiveTrade => "active_trade",
                    FillSource::HistorySync => "history_sync",
                },
            ],
        )?;
        Ok(())
    }

    /// Upsert the mirror row for an open position.
    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO positions
                (symbol, quantity, entry_price, take_profit, stop_loss, opened_at, regime, strategy, opportunity_score)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(symbol) DO UPDATE SET
                quantity = ?2,
                entry_price = ?3,
                take_profit = ?4,
                stop_loss = ?5,
                opened_at = ?6,
                regime = ?7,
                strategy = ?8,
                opportunity_score = ?9
            "#,
            params![
                position.symbol,
                position.quantity.to_string(),
                position.entry_price.to_string(),
                position.take_profit.to_string(),
                position.stop_loss.to_string(),
                position.opened_at.to_rfc3339(),
                position.regime_at_entry.as_str(),
                position.strategy,
                position.opportunity_score,
            ],
        )?;
        Ok(())
    }

    pub fn remove_position(&self, symbol: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    /// Record a system-state key (mode, regime) for external monitors.
    pub fn set_system_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO system_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn trade_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
