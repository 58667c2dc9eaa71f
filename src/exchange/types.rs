//! Domain types for the spot exchange contract.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed errors every exchange operation can return.
///
/// Callers match on the variant to pick a recovery strategy; only the agent
/// loop converts these into degraded-mode flags.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("price {price} violates tick size for {symbol}")]
    PriceIncrementInvalid { symbol: String, price: Decimal },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange unavailable: {0}")]
    Unavailable(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ExchangeError::Unavailable(err.to_string())
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

/// Exchange-enforced trading rules for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRule {
    /// Symbol key, e.g. "BTC-USDT"
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Price increment; all order prices are multiples of this
    pub tick_size: Decimal,
    /// Quantity increment; all order quantities are multiples of this
    pub lot_size: Decimal,
    /// Minimum order value in quote currency
    pub min_notional: Decimal,
    /// Whether the pair is currently tradable
    pub active: bool,
    /// When these rules were last fetched
    pub refreshed_at: DateTime<Utc>,
}

/// Ticker snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// 24h quote-currency volume
    pub volume_24h: Decimal,
    /// 24h price change as a fraction (0.05 = +5%)
    pub change_24h: Decimal,
}

impl Ticker {
    /// Bid/ask spread as a fraction of the mid price.
    pub fn spread(&self) -> Decimal {
        let mid = (self.best_bid + self.best_ask) / Decimal::TWO;
        if mid > Decimal::ZERO {
            (self.best_ask - self.best_bid) / mid
        } else {
            Decimal::ZERO
        }
    }
}

/// Candle timeframes used by the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    /// KuCoin kline type string.
    pub fn api_name(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::H1 => "1hour",
        }
    }

    pub fn seconds(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3600,
        }
    }

    /// All timeframes the multi-timeframe check confirms across.
    pub fn all() -> [Timeframe; 4] {
        [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1]
    }
}

/// One closed OHLCV candle. Immutable once the interval is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Free/locked balance for one asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Order side (spot long only: buys open, sells close).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// New order request sent through [`super::SpotExchange::place_order`].
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders
    pub price: Option<Decimal>,
    /// Reject instead of crossing the book (maker-only exits)
    pub post_only: bool,
    /// Idempotency key passed through to the exchange
    pub client_oid: Option<String>,
}

/// An order resting on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Quote currency reserved by the order
    pub reserved_funds: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Full detail for a single order lookup.
#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub is_active: bool,
    pub filled_quantity: Decimal,
    pub filled_notional: Decimal,
    pub fee: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderDetail {
    /// Volume-weighted fill price, zero if nothing filled.
    pub fn avg_price(&self) -> Decimal {
        if self.filled_quantity > Decimal::ZERO {
            self.filled_notional / self.filled_quantity
        } else {
            Decimal::ZERO
        }
    }
}

/// A historical fill from the exchange's closed-order feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Canceled,
    NotFound,
}
