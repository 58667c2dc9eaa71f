//! State / ledger / exchange reconciliation.
//!
//! Converges four views of the world - in-memory state, the durable state
//! file, the trade ledger, and the live exchange - back to a single
//! consistent picture after crashes, missed fills, manual interventions
//! or dust sweeps. Runs at startup and on a periodic cadence.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::config::{ReconcileConfig, RiskConfig, TradingConfig};
use crate::exchange::{OrderSide, SpotExchange, Ticker};
use crate::ledger::TradeLedger;
use crate::regime::Regime;
use crate::state::{CapitalAwareness, PendingBuy, Position, StateStore};

/// Overall severity of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    Ok,
    Warn,
    Critical,
}

/// Structured result of a pass.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub adopted_positions: Vec<String>,
    pub removed_positions: Vec<String>,
    pub synced_quantities: Vec<String>,
    pub reconstructed_entries: Vec<String>,
    pub dropped_pendings: Vec<String>,
    pub adopted_pendings: Vec<String>,
    pub corrected_levels: Vec<String>,
    pub notes: Vec<String>,
}

impl ReconcileReport {
    fn clean() -> Self {
        Self {
            status: ReconcileStatus::Ok,
            adopted_positions: Vec::new(),
            removed_positions: Vec::new(),
            synced_quantities: Vec::new(),
            reconstructed_entries: Vec::new(),
            dropped_pendings: Vec::new(),
            adopted_pendings: Vec::new(),
            corrected_levels: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn critical(note: String) -> Self {
        let mut report = Self::clean();
        report.status = ReconcileStatus::Critical;
        report.notes.push(note);
        report
    }

    /// A pass that changed anything is WARN; untouched is OK.
    fn finalize(mut self) -> Self {
        if self.status == ReconcileStatus::Critical {
            return self;
        }
        let touched = !self.adopted_positions.is_empty()
            || !self.removed_positions.is_empty()
            || !self.synced_quantities.is_empty()
            || !self.reconstructed_entries.is_empty()
            || !self.dropped_pendings.is_empty()
            || !self.adopted_pendings.is_empty()
            || !self.corrected_levels.is_empty();
        self.status = if touched {
            ReconcileStatus::Warn
        } else {
            ReconcileStatus::Ok
        };
        self
    }
}

/// Drives reconciliation passes.
pub struct Reconciler {
    config: ReconcileConfig,
    trading: TradingConfig,
    risk: RiskConfig,
    stablecoins: HashSet<String>,
}

impl Reconciler {
    pub fn new(
        config: ReconcileConfig,
        trading: TradingConfig,
        risk: RiskConfig,
        stablecoins: HashSet<String>,
    ) -> Self {
        Self {
            config,
            trading,
            risk,
            stablecoins,
        }
    }

    /// Run one full pass and fold the outcome into state.
    pub async fn run(
        &self,
        exchange: &dyn SpotExchange,
        state: &mut StateStore,
        ledger: &TradeLedger,
    ) -> Result<ReconcileReport> {
        let (balances, open_orders, tickers) = match tokio::try_join!(
            exchange.get_balances(),
            exchange.get_open_orders(),
            exchange.get_all_tickers(),
        ) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Reconcile pass could not reach the exchange");
                let report = ReconcileReport::critical(format!("exchange unreachable: {e}"));
                state.mutate(|s| s.last_reconcile_critical = true)?;
                return Ok(report);
            }
        };

        let mut report = ReconcileReport::clean();
        let price_of: HashMap<String, Decimal> = tickers
            .iter()
            .map(|t: &Ticker| (t.symbol.clone(), t.price))
            .collect();
        let quote = self.trading.quote_currency.clone();

        // Live base holdings by full symbol, ignoring quote and stables
        let mut live_holdings: HashMap<String, Decimal> = HashMap::new();
        for (asset, balance) in &balances {
            if *asset == quote || self.stablecoins.contains(asset) {
                continue;
            }
            let total = balance.total();
            if total > Decimal::ZERO {
                live_holdings.insert(format!("{asset}-{quote}"), total);
            }
        }

        let snapshot = state.snapshot();

        // 1-2. Walk tracked positions against live balances
        for (symbol, position) in &snapshot.positions {
            let live = live_holdings.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let price = price_of
                .get(symbol)
                .copied()
                .unwrap_or(position.current_price);
            let live_value = live * price;

            if live_value < self.config.dust_threshold {
                // Sold externally, swept, or ledger-closed before a crash
                info!(%symbol, %live_value, "Removing position without live backing");
                report.removed_positions.push(symbol.clone());
                continue;
            }

            if (live - position.quantity).abs() * price >= self.config.dust_threshold {
                info!(%symbol, stored = %position.quantity, %live, "Syncing drifted quantity");
                report.synced_quantities.push(symbol.clone());
            }

            if position.entry_price <= Decimal::ZERO {
                info!(%symbol, "Entry price unknown, reconstructing from ledger");
                report.reconstructed_entries.push(symbol.clone());
            }
        }

        // 3. Adopt live holdings the state does not track
        for (symbol, live) in &live_holdings {
            if snapshot.positions.contains_key(symbol) {
                continue;
            }
            let price = price_of.get(symbol).copied().unwrap_or(Decimal::ZERO);
            if *live * price < self.config.dust_threshold || price <= Decimal::ZERO {
                continue;
            }
            info!(%symbol, quantity = %live, "Adopting untracked holding");
            report.adopted_positions.push(symbol.clone());
        }

        // 4-5. Pending buys vs live open orders
        let live_buy_orders: HashMap<String, &crate::exchange::OpenOrder> = open_orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| (o.order_id.clone(), o))
            .collect();

        for (symbol, pending) in &snapshot.pending_buys {
            if !live_buy_orders.contains_key(&pending.order_id) {
                info!(%symbol, order_id = %pending.order_id, "Dropping pending buy with no live order");
                report.dropped_pendings.push(symbol.clone());
            }
        }
        let tracked_order_ids: HashSet<String> = snapshot
            .pending_buys
            .values()
            .map(|p| p.order_id.clone())
            .collect();
        for order in live_buy_orders.values() {
            if !tracked_order_ids.contains(&order.order_id)
                && !snapshot.positions.contains_key(&order.symbol)
            {
                info!(symbol = %order.symbol, order_id = %order.order_id, "Adopting untracked open order");
                report.adopted_pendings.push(order.symbol.clone());
            }
        }

        // Apply everything in one state transition
        let report_for_apply = report.clone();
        let risk = self.risk.clone();
        let quote_balance = balances.get(&quote).cloned().unwrap_or_default();

        state.mutate(|s| {
            for symbol in &report_for_apply.removed_positions {
                s.positions.remove(symbol);
            }
            for symbol in &report_for_apply.synced_quantities {
                if let (Some(position), Some(live)) =
                    (s.positions.get_mut(symbol), live_holdings.get(symbol))
                {
                    position.quantity = *live;
                }
            }
            for symbol in &report_for_apply.reconstructed_entries {
                let Some(position) = s.positions.get_mut(symbol) else {
                    continue;
                };
                let fallback = price_of
                    .get(symbol)
                    .copied()
                    .unwrap_or(position.current_price);
                let entry = ledger
                    .reconstruct_entry(symbol)
                    .ok()
                    .flatten()
                    .map(|(price, _)| price)
                    .filter(|p| *p > Decimal::ZERO)
                    .unwrap_or(fallback);
                position.entry_price = entry;
                position.take_profit = entry * (Decimal::ONE + risk.take_profit_pct);
                position.stop_loss = entry * (Decimal::ONE - risk.stop_loss_pct);
            }
            for symbol in &report_for_apply.adopted_positions {
                let Some(live) = live_holdings.get(symbol) else {
                    continue;
                };
                let price = price_of.get(symbol).copied().unwrap_or(Decimal::ZERO);
                // Prefer the ledger's FIFO view of what we paid
                let (entry_price, _) = ledger
                    .reconstruct_entry(symbol)
                    .ok()
                    .flatten()
                    .unwrap_or((price, *live));
                let entry_price = if entry_price > Decimal::ZERO {
                    entry_price
                } else {
                    price
                };
                s.positions.insert(
                    symbol.clone(),
                    Position {
                        symbol: symbol.clone(),
                        quantity: *live,
                        entry_price,
                        entry_fee: Decimal::ZERO,
                        current_price: price,
                        take_profit: entry_price * (Decimal::ONE + risk.take_profit_pct),
                        stop_loss: entry_price * (Decimal::ONE - risk.stop_loss_pct),
                        high_water_gain_pct: Decimal::ZERO,
                        opened_at: Utc::now(),
                        regime_at_entry: Regime::Unknown,
                        strategy: "existing".to_string(),
                        opportunity_score: 50.0,
                        entry_order_id: None,
                    },
                );
            }
            for symbol in &report_for_apply.dropped_pendings {
                s.pending_buys.remove(symbol);
            }
            for symbol in &report_for_apply.adopted_pendings {
                if let Some(order) = open_orders
                    .iter()
                    .find(|o| o.symbol == *symbol && o.side == OrderSide::Buy)
                {
                    s.pending_buys.insert(
                        symbol.clone(),
                        PendingBuy {
                            symbol: symbol.clone(),
                            order_id: order.order_id.clone(),
                            reserved_notional: order.reserved_funds,
                            price: order.price,
                            quantity: order.quantity,
                            take_profit: order.price * (Decimal::ONE + risk.take_profit_pct),
                            stop_loss: order.price * (Decimal::ONE - risk.stop_loss_pct),
                            regime_at_entry: Regime::Unknown,
                            strategy: "existing".to_string(),
                            opportunity_score: 50.0,
                            placed_at: order.created_at,
                        },
                    );
                }
            }

            // Keep marks fresh while we are here
            for (symbol, position) in s.positions.iter_mut() {
                if let Some(price) = price_of.get(symbol) {
                    if *price > Decimal::ZERO {
                        position.current_price = *price;
                    }
                }
            }

            // 6. Capital awareness from authoritative numbers
            s.capital = CapitalAwareness::recompute(&quote_balance, &s.positions, &s.pending_buys);
        })?;

        // 7. Repair inverted or missing protective levels
        let corrections = self.correct_levels(state)?;
        report.corrected_levels = corrections;

        // Logic invariants after convergence are an alarm, not a shrug
        let violations = state.snapshot().invariant_violations();
        if !violations.is_empty() {
            for v in &violations {
                warn!(violation = %v, "Invariant violation after reconcile");
            }
            report.notes.extend(violations);
            report.status = ReconcileStatus::Critical;
        }

        let report = report.finalize();
        state.mutate(|s| s.last_reconcile_critical = report.status == ReconcileStatus::Critical)?;

        info!(
            status = ?report.status,
            adopted = report.adopted_positions.len(),
            removed = report.removed_positions.len(),
            dropped_pendings = report.dropped_pendings.len(),
            adopted_pendings = report.adopted_pendings.len(),
            corrected = report.corrected_levels.len(),
            "Reconcile pass complete"
        );
        Ok(report)
    }

    /// Re-derive TP/SL for positions whose levels are missing or inverted.
    fn correct_levels(&self, state: &mut StateStore) -> Result<Vec<String>> {
        let snapshot = state.snapshot();
        let broken: Vec<String> = snapshot
            .positions
            .values()
            .filter(|p| {
                p.take_profit <= p.entry_price
                    || p.stop_loss >= p.entry_price
                    || p.stop_loss <= Decimal::ZERO
            })
            .map(|p| p.symbol.clone())
            .collect();

        if broken.is_empty() {
            return Ok(Vec::new());
        }

        let risk = self.risk.clone();
        state.mutate(|s| {
            for symbol in &broken {
                if let Some(position) = s.positions.get_mut(symbol) {
                    position.take_profit =
                        position.entry_price * (Decimal::ONE + risk.take_profit_pct);
                    position.stop_loss =
                        position.entry_price * (Decimal::ONE - risk.stop_loss_pct);
                    warn!(%symbol, "Protective levels re-derived from entry");
                }
            }
        })?;
        Ok(broken)
    }
}
