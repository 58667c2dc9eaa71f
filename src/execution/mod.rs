//! Order execution and position lifecycle.
//!
//! Entries are limit buys recorded as [`PendingBuy`] in the state store
//! *before* the network call goes out, so a crash mid-placement leaves a
//! record the reconciler can resolve against the exchange. Exits follow
//! the reason: a take-profit rests as a maker-priced limit at the target,
//! everything else (stops, decay, recycling) goes straight to market.
//!
//! In paper mode the engine settles everything locally and never calls
//! the order endpoints.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{error, info, warn};

use crate::config::FeeConfig;
use crate::exchange::{
    CancelStatus, ExchangeError, NewOrder, OrderDetail, OrderSide, OrderType, SpotExchange,
};
use crate::ledger::{CloseReason, FillSource, TradeLedger, TradeRecord, TradeStore};
use crate::regime::Regime;
use crate::risk::TradePlan;
use crate::state::{PendingBuy, Position, StateStore};

/// How long to poll a maker exit before falling back to market.
const EXIT_POLL_ATTEMPTS: u32 = 5;
const EXIT_POLL_DELAY_MS: u64 = 200;

/// Typed failures surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("an order for {0} is already in flight")]
    DuplicateInFlight(String),

    #[error("order below exchange minimum after rounding")]
    BelowMinimum,

    #[error("price increment drift for {0}; rule refresh required")]
    PriceIncrementInvalid(String),

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("insufficient balance; reconciliation required")]
    InsufficientBalance,

    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl ExecutionError {
    fn from_exchange(err: ExchangeError, symbol: &str) -> Self {
        match err {
            ExchangeError::RateLimited { .. } => ExecutionError::RateLimited,
            ExchangeError::InsufficientBalance(_) => ExecutionError::InsufficientBalance,
            ExchangeError::PriceIncrementInvalid { .. } => {
                ExecutionError::PriceIncrementInvalid(symbol.to_string())
            }
            ExchangeError::UnknownSymbol(s) => ExecutionError::Transport(format!("unknown symbol {s}")),
            ExchangeError::Unavailable(msg) => ExecutionError::ExchangeUnavailable(msg),
            ExchangeError::Transport(msg) => ExecutionError::Transport(msg),
        }
    }
}

/// Places and settles orders, maintaining the position lifecycle.
pub struct ExecutionEngine {
    paper: bool,
    fees: FeeConfig,
    pending_ttl: Duration,
    paper_seq: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(paper: bool, fees: FeeConfig, pending_ttl_secs: u64) -> Self {
        Self {
            paper,
            fees,
            pending_ttl: Duration::seconds(pending_ttl_secs as i64),
            paper_seq: AtomicU64::new(1),
        }
    }

    pub fn is_paper(&self) -> bool {
        self.paper
    }

    fn next_paper_id(&self) -> String {
        format!("paper-{}", self.paper_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Place an entry order for a sized plan.
    ///
    /// Preconditions enforced here: no live position and no in-flight buy
    /// for the symbol. The pending entry is committed to durable state
    /// before the order leaves the process, and rolled back on failure.
    pub async fn open(
        &self,
        exchange: &dyn SpotExchange,
        state: &mut StateStore,
        ledger: &mut TradeLedger,
        store: Option<&TradeStore>,
        plan: &TradePlan,
        opportunity_score: f64,
        regime: Regime,
    ) -> Result<String, ExecutionError> {
        let symbol = plan.symbol.clone();

        {
            let snapshot = state.snapshot();
            if snapshot.positions.contains_key(&symbol)
                || snapshot.pending_buys.contains_key(&symbol)
            {
                return Err(ExecutionError::DuplicateInFlight(symbol));
            }
        }
        if plan.quantity <= Decimal::ZERO {
            return Err(ExecutionError::BelowMinimum);
        }

        if self.paper {
            return self
                .paper_open(state, ledger, store, plan, opportunity_score, regime)
                .await;
        }

        // Record the reservation before any network IO
        let client_oid = format!("sa-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let pending = PendingBuy {
            symbol: symbol.clone(),
            order_id: client_oid.clone(),
            reserved_notional: plan.notional,
            price: plan.entry_price,
            quantity: plan.quantity,
            take_profit: plan.take_profit,
            stop_loss: plan.stop_loss,
            regime_at_entry: regime,
            strategy: "swing".to_string(),
            opportunity_score,
            placed_at: Utc::now(),
        };
        let reserved = plan.notional;
        state
            .mutate(|s| {
                s.pending_buys.insert(symbol.clone(), pending);
                // Reserve the notional immediately; the next awareness pass
                // re-reads the authoritative balance
                s.capital.available = (s.capital.available - reserved).max(Decimal::ZERO);
                s.capital.refresh_totals(&s.positions, &s.pending_buys);
            })
            .map_err(|e| ExecutionError::State(e.to_string()))?;

        let order = NewOrder {
            symbol: symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: plan.quantity,
            price: Some(plan.entry_price),
            post_only: false,
            client_oid: Some(client_oid),
        };

        match exchange.place_order(&order).await {
            Ok(order_id) => {
                state
                    .mutate(|s| {
                        if let Some(p) = s.pending_buys.get_mut(&symbol) {
                            p.order_id = order_id.clone();
                        }
                    })
                    .map_err(|e| ExecutionError::State(e.to_string()))?;
                info!(
                    %symbol,
                    order_id,
                    price = %plan.entry_price,
                    quantity = %plan.quantity,
                    notional = %plan.notional,
                    "Entry order placed"
                );
                Ok(order_id)
            }
            Err(e) => {
                // Roll the reservation back; nothing reached the venue
                state
                    .mutate(|s| {
                        s.pending_buys.remove(&symbol);
                        s.capital.available += reserved;
                        s.capital.refresh_totals(&s.positions, &s.pending_buys);
                    })
                    .map_err(|se| ExecutionError::State(se.to_string()))?;
                warn!(%symbol, error = %e, "Entry order failed");
                Err(ExecutionError::from_exchange(e, &symbol))
            }
        }
    }

    /// Paper entry: settle the fill locally at the plan price.
    async fn paper_open(
        &self,
        state: &mut StateStore,
        ledger: &mut TradeLedger,
        store: Option<&TradeStore>,
        plan: &TradePlan,
        opportunity_score: f64,
        regime: Regime,
    ) -> Result<String, ExecutionError> {
        let order_id = self.next_paper_id();
        let fee = plan.notional * self.fees.taker_fee;

        let position = Position {
            symbol: plan.symbol.clone(),
            quantity: plan.quantity,
            entry_price: plan.entry_price,
            entry_fee: fee,
            current_price: plan.entry_price,
            take_profit: plan.take_profit,
            stop_loss: plan.stop_loss,
            high_water_gain_pct: Decimal::ZERO,
            opened_at: Utc::now(),
            regime_at_entry: regime,
            strategy: "swing".to_string(),
            opportunity_score,
            entry_order_id: Some(order_id.clone()),
        };

        let record = TradeRecord {
            id: ledger.next_id(&plan.symbol),
            symbol: plan.symbol.clone(),
            side: OrderSide::Buy,
            quantity: plan.quantity,
            price: plan.entry_price,
            fees: fee,
            timestamp: Utc::now(),
            reason: None,
            realized_pnl: None,
            fill_source: FillSource::ActiveTrade,
        };
        ledger
            .append(&record)
            .map_err(|e| ExecutionError::State(e.to_string()))?;
        mirror(store, |s| s.record_trade(&record));
        mirror(store, |s| s.upsert_position(&position));

        state
            .mutate(|s| {
                s.daily.trades += 1;
                s.daily.fees_paid += fee;
                s.positions.insert(plan.symbol.clone(), position);
                // The venue never sees paper fills; spend the quote locally
                s.capital.available =
                    (s.capital.available - plan.notional - fee).max(Decimal::ZERO);
                s.capital.refresh_totals(&s.positions, &s.pending_buys);
            })
            .map_err(|e| ExecutionError::State(e.to_string()))?;

        info!(symbol = %plan.symbol, order_id, "Paper entry filled");
        Ok(order_id)
    }

    /// Promote filled pending buys into positions; drop vanished orders.
    pub async fn check_pending(
        &self,
        exchange: &dyn SpotExchange,
        state: &mut StateStore,
        ledger: &mut TradeLedger,
        store: Option<&TradeStore>,
    ) -> Result<(), ExecutionError> {
        let pending: Vec<PendingBuy> = state.snapshot().pending_buys.values().cloned().collect();

        for entry in pending {
            let detail = match exchange.get_order(&entry.order_id, &entry.symbol).await {
                Ok(Some(detail)) => detail,
                Ok(None) => {
                    warn!(symbol = %entry.symbol, order_id = %entry.order_id, "Pending order vanished, releasing reservation");
                    state
                        .mutate(|s| {
                            if let Some(dropped) = s.pending_buys.remove(&entry.symbol) {
                                s.capital.available += dropped.reserved_notional;
                            }
                            s.capital.refresh_totals(&s.positions, &s.pending_buys);
                        })
                        .map_err(|e| ExecutionError::State(e.to_string()))?;
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %entry.symbol, error = %e, "Pending order lookup failed");
                    continue;
                }
            };

            if detail.is_active {
                continue;
            }
            if detail.filled_quantity <= Decimal::ZERO {
                // Canceled without fill
                state
                    .mutate(|s| {
                        if let Some(dropped) = s.pending_buys.remove(&entry.symbol) {
                            s.capital.available += dropped.reserved_notional;
                        }
                        s.capital.refresh_totals(&s.positions, &s.pending_buys);
                    })
                    .map_err(|e| ExecutionError::State(e.to_string()))?;
                continue;
            }

            self.promote_fill(state, ledger, store, &entry, &detail)?;
        }
        Ok(())
    }

    fn promote_fill(
        &self,
        state: &mut StateStore,
        ledger: &mut TradeLedger,
        store: Option<&TradeStore>,
        entry: &PendingBuy,
        detail: &OrderDetail,
    ) -> Result<(), ExecutionError> {
        let fill_price = if detail.avg_price() > Decimal::ZERO {
            detail.avg_price()
        } else {
            entry.price
        };

        let position = Position {
            symbol: entry.symbol.clone(),
            quantity: detail.filled_quantity,
            entry_price: fill_price,
            entry_fee: detail.fee,
            current_price: fill_price,
            take_profit: entry.take_profit,
            stop_loss: entry.stop_loss,
            high_water_gain_pct: Decimal::ZERO,
            opened_at: entry.placed_at,
            regime_at_entry: entry.regime_at_entry,
            strategy: entry.strategy.clone(),
            opportunity_score: entry.opportunity_score,
            entry_order_id: Some(entry.order_id.clone()),
        };

        let record = TradeRecord {
            id: ledger.next_id(&entry.symbol),
            symbol: entry.symbol.clone(),
            side: OrderSide::Buy,
            quantity: detail.filled_quantity,
            price: fill_price,
            fees: detail.fee,
            timestamp: Utc::now(),
            reason: None,
            realized_pnl: None,
            fill_source: FillSource::ActiveTrade,
        };
        ledger
            .append(&record)
            .map_err(|e| ExecutionError::State(e.to_string()))?;
        mirror(store, |s| s.record_trade(&record));
        mirror(store, |s| s.upsert_position(&position));

        info!(
            symbol = %entry.symbol,
            order_id = %entry.order_id,
            price = %fill_price,
            quantity = %detail.filled_quantity,
            fee = %detail.fee,
            "Entry filled"
        );

        state
            .mutate(|s| {
                s.pending_buys.remove(&entry.symbol);
                s.daily.trades += 1;
                s.daily.fees_paid += detail.fee;
                s.positions.insert(entry.symbol.clone(), position);
                s.capital.refresh_totals(&s.positions, &s.pending_buys);
            })
            .map_err(|e| ExecutionError::State(e.to_string()))
    }

    /// Cancel pending buys older than the configured TTL.
    pub async fn cancel_stale_pending(
        &self,
        exchange: &dyn SpotExchange,
        state: &mut StateStore,
    ) -> Result<usize, ExecutionError> {
        let now = Utc::now();
        let stale: Vec<PendingBuy> = state
            .snapshot()
            .pending_buys
            .values()
            .filter(|p| now - p.placed_at > self.pending_ttl)
            .cloned()
            .collect();

        let mut canceled = 0usize;
        for entry in stale {
            if !self.paper {
                match exchange.cancel_order(&entry.order_id, &entry.symbol).await {
                    Ok(CancelStatus::Canceled) | Ok(CancelStatus::NotFound) => {}
                    Err(e) => {
                        warn!(symbol = %entry.symbol, error = %e, "Stale pending cancel failed");
                        continue;
                    }
                }
            }
            info!(symbol = %entry.symbol, order_id = %entry.order_id, "Stale pending buy canceled");
            state
                .mutate(|s| {
                    if let Some(dropped) = s.pending_buys.remove(&entry.symbol) {
                        s.capital.available += dropped.reserved_notional;
                    }
                    s.capital.refresh_totals(&s.positions, &s.pending_buys);
                })
                .map_err(|e| ExecutionError::State(e.to_string()))?;
            canceled += 1;
        }
        Ok(canceled)
    }

    /// Close a position. A take-profit rests at the target as a
    /// maker-priced limit; every other exit crosses the spread immediately
    /// at the current price.
    ///
    /// The trade record is committed to the ledger *before* the position
    /// leaves the state store.
    pub async fn close(
        &self,
        exchange: &dyn SpotExchange,
        state: &mut StateStore,
        ledger: &mut TradeLedger,
        store: Option<&TradeStore>,
        symbol: &str,
        reason: CloseReason,
    ) -> Result<TradeRecord, ExecutionError> {
        let Some(position) = state.snapshot().positions.get(symbol).cloned() else {
            return Err(ExecutionError::Transport(format!(
                "no open position for {symbol}"
            )));
        };

        let (exit_price, exit_fee) = if self.paper {
            self.paper_exit_fill(&position, reason)
        } else {
            self.live_exit_fill(exchange, &position, reason).await?
        };

        let gross = position.quantity * (exit_price - position.entry_price);
        let realized = gross - exit_fee - position.entry_fee;

        let record = TradeRecord {
            id: ledger.next_id(symbol),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            quantity: position.quantity,
            price: exit_price,
            fees: exit_fee,
            timestamp: Utc::now(),
            reason: Some(reason),
            realized_pnl: Some(realized),
            fill_source: FillSource::ActiveTrade,
        };

        // Ledger first: a crash here leaves a ledger-closed position the
        // reconciler will finish removing
        ledger
            .append(&record)
            .map_err(|e| ExecutionError::State(e.to_string()))?;
        mirror(store, |s| s.record_trade(&record));
        mirror(store, |s| s.remove_position(symbol));

        state
            .mutate(|s| {
                s.positions.remove(symbol);
                s.daily.realized_pnl += realized;
                s.daily.fees_paid += exit_fee;
                if realized > Decimal::ZERO {
                    s.daily.wins += 1;
                    s.consecutive_losses = 0;
                } else {
                    s.daily.losses += 1;
                    s.consecutive_losses += 1;
                }
                // Sale proceeds are spendable this cycle (recycling relies
                // on it); awareness re-reads the venue next cycle
                s.capital.available += position.quantity * exit_price - exit_fee;
                s.capital.refresh_totals(&s.positions, &s.pending_buys);
            })
            .map_err(|e| ExecutionError::State(e.to_string()))?;

        info!(
            %symbol,
            reason = %reason,
            exit_price = %exit_price,
            realized = %realized,
            "Position closed"
        );
        Ok(record)
    }

    fn paper_exit_fill(&self, position: &Position, reason: CloseReason) -> (Decimal, Decimal) {
        // Only a take-profit fills at the target; every other exit
        // (recycling included) realizes whatever the market is paying now
        let (price, fee_rate) = match reason {
            CloseReason::TakeProfit => (position.take_profit, self.fees.maker_fee),
            _ => (position.current_price, self.fees.taker_fee),
        };
        (price, position.quantity * price * fee_rate)
    }

    async fn live_exit_fill(
        &self,
        exchange: &dyn SpotExchange,
        position: &Position,
        reason: CloseReason,
    ) -> Result<(Decimal, Decimal), ExecutionError> {
        let symbol = &position.symbol;
        // A recycle fires below the target by construction; resting a limit
        // there would stall the very capital it is meant to free. Market out.
        let use_limit = matches!(reason, CloseReason::TakeProfit);

        let order = NewOrder {
            symbol: symbol.clone(),
            side: OrderSide::Sell,
            order_type: if use_limit { OrderType::Limit } else { OrderType::Market },
            quantity: position.quantity,
            price: use_limit.then_some(position.take_profit),
            post_only: false,
            client_oid: None,
        };

        let order_id = exchange.place_order(&order).await.map_err(|e| {
            if matches!(e, ExchangeError::InsufficientBalance(_)) {
                // Held quantity may have shrunk outside the agent (dust
                // sweeps, manual sells); the reconciler resolves it
                error!(%symbol, "Exit hit insufficient balance; requesting reconciliation");
            }
            ExecutionError::from_exchange(e, symbol)
        })?;

        // Poll for the fill within a bounded budget
        for _ in 0..EXIT_POLL_ATTEMPTS {
            match exchange.get_order(&order_id, symbol).await {
                Ok(Some(detail)) if !detail.is_active && detail.filled_quantity > Decimal::ZERO => {
                    return Ok((detail.avg_price(), detail.fee));
                }
                Ok(_) => sleep(TokioDuration::from_millis(EXIT_POLL_DELAY_MS)).await,
                Err(e) => {
                    warn!(%symbol, error = %e, "Exit fill lookup failed");
                    sleep(TokioDuration::from_millis(EXIT_POLL_DELAY_MS)).await;
                }
            }
        }

        if use_limit {
            // Unfilled maker exit: pull it and cross the spread instead
            match exchange.cancel_order(&order_id, symbol).await {
                Ok(CancelStatus::NotFound) => {
                    // Filled while we were canceling
                    if let Ok(Some(detail)) = exchange.get_order(&order_id, symbol).await {
                        if detail.filled_quantity > Decimal::ZERO {
                            return Ok((detail.avg_price(), detail.fee));
                        }
                    }
                }
                Ok(CancelStatus::Canceled) => {}
                Err(e) => return Err(ExecutionError::from_exchange(e, symbol)),
            }

            let market = NewOrder {
                symbol: symbol.clone(),
                side: OrderSide::Sell,
                order_type: OrderType::Market,
                quantity: position.quantity,
                price: None,
                post_only: false,
                client_oid: None,
            };
            let market_id = exchange
                .place_order(&market)
                .await
                .map_err(|e| ExecutionError::from_exchange(e, symbol))?;
            for _ in 0..EXIT_POLL_ATTEMPTS {
                if let Ok(Some(detail)) = exchange.get_order(&market_id, symbol).await {
                    if !detail.is_active && detail.filled_quantity > Decimal::ZERO {
                        return Ok((detail.avg_price(), detail.fee));
                    }
                }
                sleep(TokioDuration::from_millis(EXIT_POLL_DELAY_MS)).await;
            }
        }

        Err(ExecutionError::ExchangeUnavailable(format!(
            "exit fill for {symbol} not observed within poll budget"
        )))
    }
}

/// Best-effort write to the derived SQLite mirror.
fn mirror<F>(store: Option<&TradeStore>, f: F)
where
    F: FnOnce(&TradeStore) -> anyhow::Result<()>,
{
    if let Some(store) = store {
        if let Err(e) = f(store) {
            warn!(error = %e, "Trade store mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, MockOp};
    use rust_decimal_macros::dec;

    struct Fixture {
        exchange: MockExchange,
        state: StateStore,
        ledger: TradeLedger,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.add_symbol("X-USDT", dec!(0.001), dec!(0.1), dec!(1)).await;
        exchange.set_price("X-USDT", dec!(10)).await;
        exchange.set_balance("USDT", dec!(1000), Decimal::ZERO).await;

        Fixture {
            exchange,
            state: StateStore::load(dir.path().join("state.json")).unwrap(),
            ledger: TradeLedger::open(dir.path().join("ledger.jsonl")).unwrap(),
            _dir: dir,
        }
    }

    fn plan() -> TradePlan {
        TradePlan {
            symbol: "X-USDT".to_string(),
            entry_price: dec!(10),
            quantity: dec!(3),
            notional: dec!(30),
            take_profit: dec!(10.15),
            stop_loss: dec!(9.5),
        }
    }

    fn live_engine() -> ExecutionEngine {
        ExecutionEngine::new(false, FeeConfig::default(), 120)
    }

    #[tokio::test]
    async fn test_open_and_promote_fill() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();

        // Auto-fill mock: order already done; promotion turns it into a position
        engine
            .check_pending(&f.exchange, &mut f.state, &mut f.ledger, None)
            .await
            .unwrap();

        let snapshot = f.state.snapshot();
        assert!(snapshot.pending_buys.is_empty());
        let position = &snapshot.positions["X-USDT"];
        assert_eq!(position.quantity, dec!(3));
        assert_eq!(position.take_profit, dec!(10.15));
        assert_eq!(snapshot.daily.trades, 1);

        // Entry row landed in the ledger
        let records = f.ledger.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_duplicate_suppression() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();

        let second = engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await;
        assert!(matches!(second, Err(ExecutionError::DuplicateInFlight(_))));

        // Exactly one pending buy recorded
        assert_eq!(f.state.snapshot().pending_buys.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_placement_rolls_back_pending() {
        let mut f = fixture().await;
        let engine = live_engine();
        f.exchange
            .fail_next(MockOp::PlaceOrder, ExchangeError::Unavailable("down".into()))
            .await;

        let result = engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await;
        assert!(matches!(result, Err(ExecutionError::ExchangeUnavailable(_))));
        assert!(f.state.snapshot().pending_buys.is_empty());
    }

    #[tokio::test]
    async fn test_price_increment_error_mapped() {
        let mut f = fixture().await;
        let engine = live_engine();
        let mut bad_plan = plan();
        bad_plan.entry_price = dec!(10.0005); // off the 0.001 tick

        let result = engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &bad_plan, 75.0, Regime::Normal)
            .await;
        assert!(matches!(result, Err(ExecutionError::PriceIncrementInvalid(_))));
        assert!(f.state.snapshot().pending_buys.is_empty());
    }

    #[tokio::test]
    async fn test_close_take_profit_appends_ledger_before_removal() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        engine
            .check_pending(&f.exchange, &mut f.state, &mut f.ledger, None)
            .await
            .unwrap();

        f.exchange.set_price("X-USDT", dec!(10.15)).await;
        let record = engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::TakeProfit)
            .await
            .unwrap();

        assert_eq!(record.side, OrderSide::Sell);
        assert_eq!(record.price, dec!(10.15));
        assert_eq!(record.reason, Some(CloseReason::TakeProfit));
        let realized = record.realized_pnl.unwrap();
        // 3 * 0.15 gross minus entry+exit fees
        assert!(realized > dec!(0.3) && realized < dec!(0.45), "realized {realized}");

        let snapshot = f.state.snapshot();
        assert!(snapshot.positions.is_empty());
        assert_eq!(snapshot.daily.wins, 1);
        assert_eq!(snapshot.consecutive_losses, 0);
        assert_eq!(f.ledger.load_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_stop_loss_counts_loss() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        engine
            .check_pending(&f.exchange, &mut f.state, &mut f.ledger, None)
            .await
            .unwrap();

        // Gap through the stop
        f.exchange.set_price("X-USDT", dec!(9.2)).await;
        f.state
            .mutate(|s| {
                s.positions.get_mut("X-USDT").unwrap().current_price = dec!(9.2);
            })
            .unwrap();

        let record = engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::StopLoss)
            .await
            .unwrap();

        assert!(record.realized_pnl.unwrap() < Decimal::ZERO);
        let snapshot = f.state.snapshot();
        assert_eq!(snapshot.daily.losses, 1);
        assert_eq!(snapshot.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_recycle_close_fills_at_market_not_target() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        engine
            .check_pending(&f.exchange, &mut f.state, &mut f.ledger, None)
            .await
            .unwrap();

        // Small gain, well short of the 10.15 target
        f.exchange.set_price("X-USDT", dec!(10.08)).await;
        let record = engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::RecycleProfit)
            .await
            .unwrap();

        assert_eq!(record.price, dec!(10.08));
        // 3 * 0.08 gross minus entry+exit taker fees
        let realized = record.realized_pnl.unwrap();
        assert!(realized > dec!(0.1) && realized < dec!(0.24), "realized {realized}");
        // Nothing left resting on the book: the capital is free immediately
        assert!(f.exchange.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_recycle_close_uses_current_price() {
        let mut f = fixture().await;
        let engine = ExecutionEngine::new(true, FeeConfig::default(), 120);

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        f.state
            .mutate(|s| {
                s.positions.get_mut("X-USDT").unwrap().current_price = dec!(10.08);
            })
            .unwrap();

        let record = engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::RecycleProfit)
            .await
            .unwrap();

        // The paper fill must not fabricate the take-profit-sized gain
        assert_eq!(record.price, dec!(10.08));
        assert!(record.realized_pnl.unwrap() < dec!(0.24));
    }

    #[tokio::test]
    async fn test_close_insufficient_balance_maps_to_reconcile_request() {
        let mut f = fixture().await;
        let engine = live_engine();

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        engine
            .check_pending(&f.exchange, &mut f.state, &mut f.ledger, None)
            .await
            .unwrap();

        f.exchange
            .fail_next(MockOp::PlaceOrder, ExchangeError::InsufficientBalance("held".into()))
            .await;
        let result = engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::StopLoss)
            .await;
        assert!(matches!(result, Err(ExecutionError::InsufficientBalance)));
        // Position stays; reconciliation will resolve it
        assert_eq!(f.state.snapshot().positions.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stale_pending() {
        let mut f = fixture().await;
        let engine = ExecutionEngine::new(false, FeeConfig::default(), 0);
        f.exchange.set_auto_fill(false).await;

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();

        // TTL of zero: instantly stale
        sleep(TokioDuration::from_millis(5)).await;
        let canceled = engine
            .cancel_stale_pending(&f.exchange, &mut f.state)
            .await
            .unwrap();
        assert_eq!(canceled, 1);
        assert!(f.state.snapshot().pending_buys.is_empty());
        assert!(f.exchange.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paper_mode_never_touches_order_endpoints() {
        let mut f = fixture().await;
        let engine = ExecutionEngine::new(true, FeeConfig::default(), 120);
        // Any order call would fail loudly
        f.exchange
            .fail_next(MockOp::PlaceOrder, ExchangeError::Unavailable("must not be called".into()))
            .await;

        engine
            .open(&f.exchange, &mut f.state, &mut f.ledger, None, &plan(), 75.0, Regime::Normal)
            .await
            .unwrap();
        let snapshot = f.state.snapshot();
        assert_eq!(snapshot.positions.len(), 1);
        assert!(snapshot.pending_buys.is_empty());

        engine
            .close(&f.exchange, &mut f.state, &mut f.ledger, None, "X-USDT", CloseReason::TakeProfit)
            .await
            .unwrap();
        assert!(f.state.snapshot().positions.is_empty());
        assert_eq!(f.ledger.load_all().unwrap().len(), 2);
    }
}
