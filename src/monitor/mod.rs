//! Per-cycle evaluation of open positions.
//!
//! Applies the exit rules in priority order (stop-loss, take-profit,
//! trailing advance, profit recycling, alpha decay) against the freshly
//! batched prices, and returns the closes to execute. The returned list
//! is deterministically ordered so a given market snapshot always
//! produces the same close sequence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::{ExecutionConfig, FeeConfig, RiskConfig};
use crate::exchange::Ticker;
use crate::ledger::CloseReason;
use crate::risk::RiskSizer;
use crate::state::StateStore;
use crate::universe::SymbolUniverse;

/// One close the monitor wants executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub symbol: String,
    pub reason: CloseReason,
}

/// Evaluates exit conditions for every open position.
pub struct PositionMonitor {
    execution: ExecutionConfig,
    risk: RiskConfig,
    fees: FeeConfig,
}

impl PositionMonitor {
    pub fn new(execution: ExecutionConfig, risk: RiskConfig, fees: FeeConfig) -> Self {
        Self {
            execution,
            risk,
            fees,
        }
    }

    /// Refresh position marks from the batched tickers, advance trailing
    /// stops, and collect exit requests.
    ///
    /// `current_scores` carries this cycle's opportunity score per symbol
    /// (absent symbols simply skip the quality-decay rule).
    pub fn evaluate(
        &self,
        state: &mut StateStore,
        tickers: &HashMap<String, Ticker>,
        universe: &SymbolUniverse,
        sizer: &RiskSizer,
        current_scores: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExitRequest>> {
        let mut requests: Vec<ExitRequest> = Vec::new();
        let symbols: Vec<String> = state.snapshot().positions.keys().cloned().collect();

        for symbol in symbols {
            // Mark-to-market and high-water update
            let price = tickers.get(&symbol).map(|t| t.price);
            state.mutate(|s| {
                if let Some(position) = s.positions.get_mut(&symbol) {
                    if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                        position.current_price = price;
                    }
                    let gain = position.unrealized_gain_pct();
                    if gain > position.high_water_gain_pct {
                        position.high_water_gain_pct = gain;
                    }
                }
            })?;

            let snapshot = state.snapshot();
            let Some(position) = snapshot.positions.get(&symbol) else {
                continue;
            };

            let price = position.current_price;
            let gain = position.unrealized_gain_pct();

            // 1. Stop-loss breach: protective exit, highest priority
            if price <= position.stop_loss {
                requests.push(ExitRequest {
                    symbol: symbol.clone(),
                    reason: CloseReason::StopLoss,
                });
                continue;
            }

            // 2. Take-profit reached, and the net result clears the buffer
            if price >= position.take_profit {
                let exit_fee = position.quantity * price * self.fees.maker_fee;
                let net = position.quantity * (price - position.entry_price)
                    - exit_fee
                    - position.entry_fee;
                if net >= self.risk.min_profit_buffer {
                    requests.push(ExitRequest {
                        symbol: symbol.clone(),
                        reason: CloseReason::TakeProfit,
                    });
                    continue;
                }
                debug!(%symbol, %net, "Target touched but net below buffer, holding");
            }

            // 3. Trailing stop advance
            if let Ok(rule) = universe.rules(&symbol) {
                if let Some(new_stop) = sizer.advance_stop(position, rule.tick_size) {
                    info!(%symbol, old = %position.stop_loss, new = %new_stop, "Trailing stop raised");
                    state.mutate(|s| {
                        if let Some(p) = s.positions.get_mut(&symbol) {
                            p.stop_loss = new_stop;
                        }
                    })?;
                }
            }

            // 4. Quality decay with a small profit: recycle the capital
            if let Some(score) = current_scores.get(&symbol) {
                let dropped = position.opportunity_score - score;
                if dropped >= self.execution.recycle_quality_drop
                    && gain >= self.execution.recycle_min_gain_pct
                {
                    requests.push(ExitRequest {
                        symbol: symbol.clone(),
                        reason: CloseReason::RecycleProfit,
                    });
                    continue;
                }
            }

            // 5. Alpha decay: stale position that never went anywhere
            let max_gain = self.execution.decay_max_gain_pct;
            if position.age_secs(now) > self.execution.decay_timeout_secs as i64
                && gain < max_gain
            {
                requests.push(ExitRequest {
                    symbol: symbol.clone(),
                    reason: CloseReason::AlphaDecay,
                });
            }
        }

        // Deterministic execution order: symbol, then rule priority
        requests.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.reason.priority().cmp(&b.reason.priority()))
        });
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, TradingConfig};
    use crate::regime::Regime;
    use crate::state::Position;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn monitor() -> PositionMonitor {
        PositionMonitor::new(
            ExecutionConfig::default(),
            RiskConfig::default(),
            FeeConfig::default(),
        )
    }

    fn sizer() -> RiskSizer {
        RiskSizer::new(
            TradingConfig::default(),
            RiskConfig::default(),
            FeeConfig::default(),
        )
    }

    fn universe(dir: &std::path::Path) -> SymbolUniverse {
        SymbolUniverse::new(
            FilterConfig::default(),
            "USDT".to_string(),
            dir.join("rules.json"),
        )
    }

    fn position(symbol: &str, entry: Decimal, tp: Decimal, sl: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: dec!(3),
            entry_price: entry,
            entry_fee: dec!(0.03),
            current_price: entry,
            take_profit: tp,
            stop_loss: sl,
            high_water_gain_pct: Decimal::ZERO,
            opened_at: Utc::now(),
            regime_at_entry: Regime::Normal,
            strategy: "swing".to_string(),
            opportunity_score: 75.0,
            entry_order_id: None,
        }
    }

    fn ticker(symbol: &str, price: Decimal) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            price,
            best_bid: price,
            best_ask: price,
            volume_24h: dec!(1_000_000),
            change_24h: Decimal::ZERO,
        }
    }

    fn setup(dir: &tempfile::TempDir) -> (StateStore, SymbolUniverse) {
        let state = StateStore::load(dir.path().join("state.json")).unwrap();
        (state, universe(dir.path()))
    }

    #[tokio::test]
    async fn test_stop_loss_breach_requested() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        state
            .mutate(|s| {
                s.positions.insert(
                    "X-USDT".to_string(),
                    position("X-USDT", dec!(10), dec!(10.15), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(9.2)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();

        assert_eq!(
            requests,
            vec![ExitRequest {
                symbol: "X-USDT".to_string(),
                reason: CloseReason::StopLoss
            }]
        );
    }

    #[tokio::test]
    async fn test_take_profit_requires_net_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        state
            .mutate(|s| {
                s.positions.insert(
                    "X-USDT".to_string(),
                    position("X-USDT", dec!(10), dec!(10.15), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(10.15)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();
        // 3 * 0.15 = 0.45 gross clears fees + buffer comfortably
        assert_eq!(requests[0].reason, CloseReason::TakeProfit);
    }

    #[tokio::test]
    async fn test_micro_gain_at_tp_holds() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        // TP barely above entry: gross cannot clear the buffer
        state
            .mutate(|s| {
                s.positions.insert(
                    "X-USDT".to_string(),
                    position("X-USDT", dec!(10), dec!(10.01), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(10.01)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_stop_advances_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, mut universe) = setup(&dir);

        // Register a rule so the trailing path has a tick size
        let exchange = crate::exchange::MockExchange::new();
        exchange.add_symbol("X-USDT", dec!(0.001), dec!(0.1), dec!(1)).await;
        universe.refresh(&exchange).await.unwrap();

        state
            .mutate(|s| {
                s.positions.insert(
                    "X-USDT".to_string(),
                    position("X-USDT", dec!(10), dec!(10.5), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(10.25)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();
        assert!(requests.is_empty());

        let snapshot = state.snapshot();
        let p = &snapshot.positions["X-USDT"];
        assert_eq!(p.high_water_gain_pct, dec!(0.025));
        // +2.5% locks 50% of the gain
        assert_eq!(p.stop_loss, dec!(10.125));
    }

    #[tokio::test]
    async fn test_quality_decay_recycles_small_profit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        state
            .mutate(|s| {
                s.positions.insert(
                    "X-USDT".to_string(),
                    position("X-USDT", dec!(10), dec!(10.5), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(10.08)));
        // Score dropped 75 -> 55 (>= 15) with +0.8% gain
        let mut scores = HashMap::new();
        scores.insert("X-USDT".to_string(), 55.0);

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &scores, Utc::now())
            .unwrap();
        assert_eq!(requests[0].reason, CloseReason::RecycleProfit);
    }

    #[tokio::test]
    async fn test_alpha_decay_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        let mut stale = position("X-USDT", dec!(10), dec!(10.5), dec!(9.5));
        stale.opened_at = Utc::now() - Duration::hours(3);
        state
            .mutate(|s| {
                s.positions.insert("X-USDT".to_string(), stale);
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("X-USDT".to_string(), ticker("X-USDT", dec!(10.02)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();
        assert_eq!(requests[0].reason, CloseReason::AlphaDecay);
    }

    #[tokio::test]
    async fn test_requests_ordered_by_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, universe) = setup(&dir);
        state
            .mutate(|s| {
                s.positions.insert(
                    "ZZZ-USDT".to_string(),
                    position("ZZZ-USDT", dec!(10), dec!(10.15), dec!(9.5)),
                );
                s.positions.insert(
                    "AAA-USDT".to_string(),
                    position("AAA-USDT", dec!(10), dec!(10.15), dec!(9.5)),
                );
            })
            .unwrap();

        let mut tickers = HashMap::new();
        tickers.insert("ZZZ-USDT".to_string(), ticker("ZZZ-USDT", dec!(9.0)));
        tickers.insert("AAA-USDT".to_string(), ticker("AAA-USDT", dec!(9.0)));

        let requests = monitor()
            .evaluate(&mut state, &tickers, &universe, &sizer(), &HashMap::new(), Utc::now())
            .unwrap();
        assert_eq!(requests[0].symbol, "AAA-USDT");
        assert_eq!(requests[1].symbol, "ZZZ-USDT");
    }
}
