//! In-memory exchange for paper trading and tests.
//!
//! Keeps a full simulated account: balances move when orders are placed,
//! filled, and canceled, so capital awareness and reconciliation behave
//! exactly as against the live venue. Tests can inject typed errors into
//! the next call of any operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::SpotExchange;
use super::types::*;

const MOCK_TAKER_FEE: Decimal = dec!(0.001);
const MOCK_MAKER_FEE: Decimal = dec!(0.001);

/// Operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Symbols,
    Tickers,
    Candles,
    Balances,
    OpenOrders,
    FilledOrders,
    PlaceOrder,
    CancelOrder,
    GetOrder,
}

#[derive(Debug, Clone)]
struct MockOrder {
    open: OpenOrder,
    order_type: OrderType,
}

#[derive(Default)]
struct MockState {
    rules: HashMap<String, SymbolRule>,
    tickers: HashMap<String, Ticker>,
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    balances: HashMap<String, AssetBalance>,
    open_orders: HashMap<String, MockOrder>,
    order_details: HashMap<String, OrderDetail>,
    fills: Vec<FilledOrder>,
    fail_next: HashMap<MockOp, VecDeque<ExchangeError>>,
    /// Fill limit orders the moment they are placed
    auto_fill: bool,
}

/// Simulated spot exchange.
pub struct MockExchange {
    state: RwLock<MockState>,
    order_seq: AtomicU64,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState {
                auto_fill: true,
                ..Default::default()
            }),
            order_seq: AtomicU64::new(1),
        }
    }

    /// Leave limit orders resting until [`fill_order`] is called.
    pub async fn set_auto_fill(&self, auto_fill: bool) {
        self.state.write().await.auto_fill = auto_fill;
    }

    /// Install or replace a symbol's trading rules.
    pub async fn set_rule(&self, rule: SymbolRule) {
        self.state.write().await.rules.insert(rule.symbol.clone(), rule);
    }

    /// Convenience: rule with the given increments, active, refreshed now.
    pub async fn add_symbol(
        &self,
        symbol: &str,
        tick_size: Decimal,
        lot_size: Decimal,
        min_notional: Decimal,
    ) {
        let (base, quote) = symbol.split_once('-').unwrap_or((symbol, "USDT"));
        self.set_rule(SymbolRule {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            tick_size,
            lot_size,
            min_notional,
            active: true,
            refreshed_at: Utc::now(),
        })
        .await;
    }

    /// Set the full ticker for a symbol.
    pub async fn set_ticker(&self, ticker: Ticker) {
        self.state.write().await.tickers.insert(ticker.symbol.clone(), ticker);
    }

    /// Move a symbol's price, deriving a tight book around it.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().await;
        let ticker = state.tickers.entry(symbol.to_string()).or_insert_with(|| Ticker {
            symbol: symbol.to_string(),
            price,
            best_bid: price,
            best_ask: price,
            volume_24h: dec!(1_000_000),
            change_24h: Decimal::ZERO,
        });
        ticker.price = price;
        ticker.best_bid = price * dec!(0.9995);
        ticker.best_ask = price * dec!(1.0005);
    }

    pub async fn set_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.state
            .write()
            .await
            .candles
            .insert((symbol.to_string(), timeframe), candles);
    }

    pub async fn set_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(asset.to_string(), AssetBalance { free, locked });
    }

    /// Queue a typed error for the next invocation of `op`.
    pub async fn fail_next(&self, op: MockOp, error: ExchangeError) {
        self.state
            .write()
            .await
            .fail_next
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fill a resting order at its limit price (or the current market price
    /// when `price_override` is given, to simulate slippage).
    pub async fn fill_order(&self, order_id: &str, price_override: Option<Decimal>) -> bool {
        let mut state = self.state.write().await;
        let Some(order) = state.open_orders.remove(order_id) else {
            return false;
        };
        let fill_price = price_override.unwrap_or(order.open.price);
        let fee_rate = match order.order_type {
            OrderType::Limit => MOCK_MAKER_FEE,
            OrderType::Market => MOCK_TAKER_FEE,
        };
        Self::settle_fill(&mut state, &order.open, fill_price, fee_rate);
        true
    }

    /// All fills recorded so far (test inspection).
    pub async fn fills(&self) -> Vec<FilledOrder> {
        self.state.read().await.fills.clone()
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn split_assets(symbol: &str) -> (String, String) {
        let (base, quote) = symbol.split_once('-').unwrap_or((symbol, "USDT"));
        (base.to_string(), quote.to_string())
    }

    /// Apply a fill: move balances, record the fill and the order detail.
    fn settle_fill(state: &mut MockState, order: &OpenOrder, price: Decimal, fee_rate: Decimal) {
        let (base, quote) = Self::split_assets(&order.symbol);
        let notional = order.quantity * price;
        let fee = notional * fee_rate;

        match order.side {
            OrderSide::Buy => {
                let quote_bal = state.balances.entry(quote).or_default();
                // Release the reservation, spend the actual notional + fee
                quote_bal.locked = (quote_bal.locked - order.reserved_funds).max(Decimal::ZERO);
                let refund = order.reserved_funds - notional - fee;
                quote_bal.free = (quote_bal.free + refund).max(Decimal::ZERO);
                state.balances.entry(base).or_default().free += order.quantity;
            }
            OrderSide::Sell => {
                let base_bal = state.balances.entry(base).or_default();
                base_bal.locked = (base_bal.locked - order.quantity).max(Decimal::ZERO);
                state.balances.entry(quote).or_default().free += notional - fee;
            }
        }

        let now = Utc::now();
        state.fills.push(FilledOrder {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            fee,
            filled_at: now,
        });
        state.order_details.insert(
            order.order_id.clone(),
            OrderDetail {
                order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                is_active: false,
                filled_quantity: order.quantity,
                filled_notional: notional,
                fee,
                created_at: order.created_at,
            },
        );
        debug!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            %price,
            "Mock fill settled"
        );
    }

    async fn take_failure(&self, op: MockOp) -> Option<ExchangeError> {
        self.state
            .write()
            .await
            .fail_next
            .get_mut(&op)
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl SpotExchange for MockExchange {
    async fn get_symbols(&self) -> ExchangeResult<Vec<SymbolRule>> {
        if let Some(e) = self.take_failure(MockOp::Symbols).await {
            return Err(e);
        }
        Ok(self.state.read().await.rules.values().cloned().collect())
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        if let Some(e) = self.take_failure(MockOp::Tickers).await {
            return Err(e);
        }
        self.state
            .read()
            .await
            .tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_all_tickers(&self) -> ExchangeResult<Vec<Ticker>> {
        if let Some(e) = self.take_failure(MockOp::Tickers).await {
            return Err(e);
        }
        Ok(self.state.read().await.tickers.values().cloned().collect())
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        if let Some(e) = self.take_failure(MockOp::Candles).await {
            return Err(e);
        }
        let state = self.state.read().await;
        let candles = state
            .candles
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn get_balances(&self) -> ExchangeResult<HashMap<String, AssetBalance>> {
        if let Some(e) = self.take_failure(MockOp::Balances).await {
            return Err(e);
        }
        Ok(self.state.read().await.balances.clone())
    }

    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        if let Some(e) = self.take_failure(MockOp::OpenOrders).await {
            return Err(e);
        }
        Ok(self
            .state
            .read()
            .await
            .open_orders
            .values()
            .map(|o| o.open.clone())
            .collect())
    }

    async fn get_filled_orders(&self, since: DateTime<Utc>) -> ExchangeResult<Vec<FilledOrder>> {
        if let Some(e) = self.take_failure(MockOp::FilledOrders).await {
            return Err(e);
        }
        Ok(self
            .state
            .read()
            .await
            .fills
            .iter()
            .filter(|f| f.filled_at >= since)
            .cloned()
            .collect())
    }

    async fn place_order(&self, order: &NewOrder) -> ExchangeResult<String> {
        if let Some(e) = self.take_failure(MockOp::PlaceOrder).await {
            return Err(e);
        }

        let order_id = self.next_order_id();
        let mut state = self.state.write().await;

        if !state.rules.contains_key(&order.symbol) {
            return Err(ExchangeError::UnknownSymbol(order.symbol.clone()));
        }

        let market_price = state
            .tickers
            .get(&order.symbol)
            .map(|t| t.price)
            .unwrap_or_default();
        let price = match order.order_type {
            OrderType::Limit => order.price.ok_or_else(|| {
                ExchangeError::Transport("limit order without price".to_string())
            })?,
            OrderType::Market => market_price,
        };
        if price <= Decimal::ZERO {
            return Err(ExchangeError::Unavailable(format!(
                "no market price for {}",
                order.symbol
            )));
        }

        // Tick/lot enforcement mirrors the live venue
        if let Some(rule) = state.rules.get(&order.symbol) {
            if rule.tick_size > Decimal::ZERO
                && order.order_type == OrderType::Limit
                && (price / rule.tick_size).fract() != Decimal::ZERO
            {
                return Err(ExchangeError::PriceIncrementInvalid {
                    symbol: order.symbol.clone(),
                    price,
                });
            }
        }

        let (base, quote) = Self::split_assets(&order.symbol);
        let notional = order.quantity * price;

        // Reserve funds
        match order.side {
            OrderSide::Buy => {
                let fee_allowance = notional * MOCK_TAKER_FEE;
                let required = notional + fee_allowance;
                let bal = state.balances.entry(quote).or_default();
                if bal.free < required {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "need {required}, have {}",
                        bal.free
                    )));
                }
                bal.free -= required;
                bal.locked += required;
            }
            OrderSide::Sell => {
                let bal = state.balances.entry(base).or_default();
                if bal.free < order.quantity {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "need {}, have {}",
                        order.quantity, bal.free
                    )));
                }
                bal.free -= order.quantity;
                bal.locked += order.quantity;
            }
        }

        let reserved = match order.side {
            OrderSide::Buy => notional + notional * MOCK_TAKER_FEE,
            OrderSide::Sell => Decimal::ZERO,
        };
        let open = OpenOrder {
            order_id: order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            quantity: order.quantity,
            reserved_funds: reserved,
            created_at: Utc::now(),
        };
        state.order_details.insert(
            order_id.clone(),
            OrderDetail {
                order_id: order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                is_active: true,
                filled_quantity: Decimal::ZERO,
                filled_notional: Decimal::ZERO,
                fee: Decimal::ZERO,
                created_at: open.created_at,
            },
        );

        let fee_rate = match order.order_type {
            OrderType::Limit => MOCK_MAKER_FEE,
            OrderType::Market => MOCK_TAKER_FEE,
        };

        if order.order_type == OrderType::Market || state.auto_fill {
            Self::settle_fill(&mut state, &open, price, fee_rate);
        } else {
            state.open_orders.insert(
                order_id.clone(),
                MockOrder {
                    open,
                    order_type: order.order_type,
                },
            );
        }

        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<CancelStatus> {
        if let Some(e) = self.take_failure(MockOp::CancelOrder).await {
            return Err(e);
        }

        let mut state = self.state.write().await;
        let Some(order) = state.open_orders.remove(order_id) else {
            return Ok(CancelStatus::NotFound);
        };

        // Release reservation
        let (base, quote) = Self::split_assets(&order.open.symbol);
        match order.open.side {
            OrderSide::Buy => {
                let bal = state.balances.entry(quote).or_default();
                bal.locked = (bal.locked - order.open.reserved_funds).max(Decimal::ZERO);
                bal.free += order.open.reserved_funds;
            }
            OrderSide::Sell => {
                let bal = state.balances.entry(base).or_default();
                bal.locked = (bal.locked - order.open.quantity).max(Decimal::ZERO);
                bal.free += order.open.quantity;
            }
        }
        state.order_details.remove(order_id);
        Ok(CancelStatus::Canceled)
    }

    async fn get_order(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> ExchangeResult<Option<OrderDetail>> {
        if let Some(e) = self.take_failure(MockOp::GetOrder).await {
            return Err(e);
        }
        Ok(self.state.read().await.order_details.get(order_id).cloned())
    }
}
