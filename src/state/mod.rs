//! Durable agent state.
//!
//! One authoritative in-memory [`AgentState`] owned by the agent loop
//! (single writer); phases read immutable snapshots. Every mutating
//! transition bumps a monotonic version counter and rewrites the state
//! file atomically, keeping the previous snapshot as `.bak` so a corrupt
//! main file can be recovered.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::exchange::AssetBalance;
use crate::regime::Regime;
use crate::utils::decimal::pct_change;
use crate::utils::fs::durable_write;

pub const STATE_SCHEMA_VERSION: u32 = 2;

/// A live long position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Full symbol, e.g. "BTC-USDT"
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_fee: Decimal,
    pub current_price: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    /// Best unrealized gain seen, drives the trailing stop ratchet
    pub high_water_gain_pct: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Regime at entry; learning buckets key on it at close
    pub regime_at_entry: Regime,
    /// Entry strategy tag ("swing" for scored entries, "existing" for
    /// positions adopted by reconciliation)
    pub strategy: String,
    /// Composite score at entry
    pub opportunity_score: f64,
    /// Exchange order id of the entry fill, when known
    #[serde(default)]
    pub entry_order_id: Option<String>,
}

impl Position {
    pub fn value(&self) -> Decimal {
        self.quantity * self.current_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.current_price - self.entry_price)
    }

    /// Unrealized gain as a fraction of entry (0.01 = +1%).
    pub fn unrealized_gain_pct(&self) -> Decimal {
        pct_change(self.current_price, self.entry_price)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_seconds()
    }
}

/// An entry order resting on the exchange, reserving capital.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBuy {
    pub symbol: String,
    pub order_id: String,
    /// Quote notional reserved until fill/cancel
    pub reserved_notional: Decimal,
    pub price: Decimal,
    pub quantity: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub regime_at_entry: Regime,
    pub strategy: String,
    pub opportunity_score: f64,
    pub placed_at: DateTime<Utc>,
}

/// Capital awareness recomputed from authoritative sources each cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapitalAwareness {
    /// Quote currency free for new entries
    pub available: Decimal,
    /// Quote currency reserved by pending buys
    pub locked: Decimal,
    /// Mark-to-market value of open positions
    pub holdings: Decimal,
    /// available + locked + holdings
    pub total_assets: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CapitalAwareness {
    /// Recompute from the exchange balance plus tracked positions/pendings.
    pub fn recompute(
        quote_balance: &AssetBalance,
        positions: &HashMap<String, Position>,
        pending: &HashMap<String, PendingBuy>,
    ) -> Self {
        let mut capital = Self {
            available: quote_balance.free,
            ..Self::default()
        };
        capital.refresh_totals(positions, pending);
        capital
    }

    /// Re-derive locked/holdings/total while keeping `available` as-is.
    ///
    /// Used for intra-cycle adjustments (an order placed or closed between
    /// two awareness refreshes) and for paper runs, where the venue never
    /// sees the fills and cannot be the source of truth for free quote.
    pub fn refresh_totals(
        &mut self,
        positions: &HashMap<String, Position>,
        pending: &HashMap<String, PendingBuy>,
    ) {
        self.locked = pending.values().map(|p| p.reserved_notional).sum();
        self.holdings = positions.values().map(|p| p.value()).sum();
        self.total_assets = self.available + self.locked + self.holdings;
        self.updated_at = Some(Utc::now());
    }
}

/// Daily trading counters, reset at the UTC day boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCounters {
    pub date: NaiveDate,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub start_balance: Decimal,
}

impl DailyCounters {
    pub fn new(date: NaiveDate, start_balance: Decimal) -> Self {
        Self {
            date,
            trades: 0,
            wins: 0,
            losses: 0,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            start_balance,
        }
    }
}

/// What the agent is currently willing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMode {
    /// Normal operation: scanning and entering
    Hunting,
    /// Circuit breaker tripped: monitor and close only
    Observing,
    /// Exchange trouble: reduced activity
    Degraded,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Hunting => write!(f, "HUNTING"),
            AgentMode::Observing => write!(f, "OBSERVING"),
            AgentMode::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// The complete durable agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub schema_version: u32,
    /// Monotonic mutation counter; lets the reconciler spot torn reads
    pub version: u64,
    pub positions: HashMap<String, Position>,
    pub pending_buys: HashMap<String, PendingBuy>,
    pub capital: CapitalAwareness,
    pub daily: DailyCounters,
    /// Consecutive losing closes (resets on any win)
    pub consecutive_losses: u32,
    pub last_regime: Regime,
    pub agent_mode: AgentMode,
    /// Whether the previous reconcile pass reported CRITICAL
    pub last_reconcile_critical: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            version: 0,
            positions: HashMap::new(),
            pending_buys: HashMap::new(),
            capital: CapitalAwareness::default(),
            daily: DailyCounters::new(Utc::now().date_naive(), Decimal::ZERO),
            consecutive_losses: 0,
            last_regime: Regime::Unknown,
            agent_mode: AgentMode::Hunting,
            last_reconcile_critical: false,
            updated_at: Utc::now(),
        }
    }
}

impl AgentState {
    /// Invariant check: violations are returned as human-readable strings
    /// and treated as logic errors by the reconciler.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (symbol, position) in &self.positions {
            if self.pending_buys.contains_key(symbol) {
                violations.push(format!("{symbol}: position and pending buy coexist"));
            }
            if position.take_profit <= position.entry_price {
                violations.push(format!(
                    "{symbol}: take-profit {} not above entry {}",
                    position.take_profit, position.entry_price
                ));
            }
            if position.stop_loss >= position.entry_price {
                violations.push(format!(
                    "{symbol}: stop-loss {} not below entry {}",
                    position.stop_loss, position.entry_price
                ));
            }
        }
        violations
    }
}

/// Owner of the durable state file.
///
/// All writes flow through [`StateStore::mutate`]; readers take cheap
/// [`StateStore::snapshot`]s that stay stable for a whole phase.
pub struct StateStore {
    state: Arc<AgentState>,
    path: PathBuf,
}

impl StateStore {
    /// Load state from disk, falling back to the `.bak` snapshot and then
    /// to a blank state (which the startup reconcile pass will repopulate).
    pub fn load(path: PathBuf) -> Result<Self> {
        let state = match Self::read_file(&path) {
            Some(state) => state,
            None => {
                let backup = path.with_extension("bak");
                match Self::read_file(&backup) {
                    Some(state) => {
                        warn!("State file unreadable, restored previous snapshot");
                        state
                    }
                    None => {
                        info!("No usable state file, starting blank");
                        AgentState::default()
                    }
                }
            }
        };

        info!(
            version = state.version,
            positions = state.positions.len(),
            pending = state.pending_buys.len(),
            mode = %state.agent_mode,
            "State loaded"
        );

        Ok(Self {
            state: Arc::new(state),
            path,
        })
    }

    fn read_file(path: &std::path::Path) -> Option<AgentState> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice::<AgentState>(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file corrupt");
                None
            }
        }
    }

    /// Immutable snapshot for the current phase.
    pub fn snapshot(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    /// Apply a mutation, bump the version, and persist atomically.
    pub fn mutate<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AgentState),
    {
        let mut next = (*self.state).clone();
        f(&mut next);
        next.version += 1;
        next.updated_at = Utc::now();
        self.state = Arc::new(next);
        self.persist()
    }

    /// Write the current state durably (kept separate so PersistPhase can
    /// force a write even without mutations).
    pub fn persist(&self) -> Result<()> {
        // Keep the previous good snapshot for corrupt-file recovery
        if self.path.exists() {
            let _ = std::fs::copy(&self.path, self.path.with_extension("bak"));
        }
        let bytes =
            serde_json::to_vec_pretty(&*self.state).context("Failed to serialize state")?;
        durable_write(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: dec!(3),
            entry_price: dec!(10),
            entry_fee: dec!(0.03),
            current_price: dec!(10),
            take_profit: dec!(10.15),
            stop_loss: dec!(9.5),
            high_water_gain_pct: Decimal::ZERO,
            opened_at: Utc::now(),
            regime_at_entry: Regime::Normal,
            strategy: "swing".to_string(),
            opportunity_score: 75.0,
            entry_order_id: None,
        }
    }

    #[test]
    fn test_position_math() {
        let mut p = position("X-USDT");
        p.current_price = dec!(10.5);
        assert_eq!(p.value(), dec!(31.5));
        assert_eq!(p.unrealized_pnl(), dec!(1.5));
        assert_eq!(p.unrealized_gain_pct(), dec!(0.05));
    }

    #[test]
    fn test_capital_awareness_identity() {
        let mut positions = HashMap::new();
        positions.insert("X-USDT".to_string(), position("X-USDT"));
        let mut pending = HashMap::new();
        pending.insert(
            "Y-USDT".to_string(),
            PendingBuy {
                symbol: "Y-USDT".to_string(),
                order_id: "1".to_string(),
                reserved_notional: dec!(12),
                price: dec!(1),
                quantity: dec!(12),
                take_profit: dec!(1.02),
                stop_loss: dec!(0.95),
                regime_at_entry: Regime::Normal,
                strategy: "swing".to_string(),
                opportunity_score: 80.0,
                placed_at: Utc::now(),
            },
        );

        let capital = CapitalAwareness::recompute(
            &AssetBalance {
                free: dec!(100),
                locked: dec!(12),
            },
            &positions,
            &pending,
        );

        assert_eq!(capital.available, dec!(100));
        assert_eq!(capital.locked, dec!(12));
        assert_eq!(capital.holdings, dec!(30));
        assert_eq!(
            capital.total_assets,
            capital.available + capital.locked + capital.holdings
        );
    }

    #[test]
    fn test_invariant_violations() {
        let mut state = AgentState::default();
        let mut bad = position("X-USDT");
        bad.take_profit = dec!(9); // below entry
        state.positions.insert("X-USDT".to_string(), bad);
        state.pending_buys.insert(
            "X-USDT".to_string(),
            PendingBuy {
                symbol: "X-USDT".to_string(),
                order_id: "1".to_string(),
                reserved_notional: dec!(12),
                price: dec!(1),
                quantity: dec!(12),
                take_profit: dec!(1.02),
                stop_loss: dec!(0.95),
                regime_at_entry: Regime::Normal,
                strategy: "swing".to_string(),
                opportunity_score: 80.0,
                placed_at: Utc::now(),
            },
        );

        let violations = state.invariant_violations();
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_store_round_trip_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_state.json");

        let mut store = StateStore::load(path.clone()).unwrap();
        store
            .mutate(|s| {
                s.positions.insert("X-USDT".to_string(), position("X-USDT"));
            })
            .unwrap();
        store
            .mutate(|s| {
                s.daily.trades += 1;
            })
            .unwrap();

        let reloaded = StateStore::load(path).unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.daily.trades, 1);
    }

    #[test]
    fn test_corrupt_state_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_state.json");

        let mut store = StateStore::load(path.clone()).unwrap();
        store
            .mutate(|s| {
                s.positions.insert("X-USDT".to_string(), position("X-USDT"));
            })
            .unwrap();
        // Second mutation rolls the first file to .bak
        store.mutate(|s| s.daily.trades += 1).unwrap();
        drop(store);

        std::fs::write(&path, b"{ corrupt").unwrap();

        let recovered = StateStore::load(path).unwrap();
        assert_eq!(recovered.snapshot().positions.len(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::load(dir.path().join("s.json")).unwrap();
        let before = store.snapshot();
        store
            .mutate(|s| {
                s.positions.insert("X-USDT".to_string(), position("X-USDT"));
            })
            .unwrap();
        assert!(before.positions.is_empty());
        assert_eq!(store.snapshot().positions.len(), 1);
    }
}
