//! The narrow interface the agent consumes from any spot exchange.
//!
//! Everything above this trait (scoring, execution, reconciliation) is
//! venue-agnostic; implementations exist for the live KuCoin REST API and
//! for an in-memory mock used by paper runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::types::{
    AssetBalance, CancelStatus, Candle, ExchangeResult, FilledOrder, NewOrder, OpenOrder,
    OrderDetail, SymbolRule, Ticker, Timeframe,
};

/// Typed client contract for a single centralized spot exchange.
#[async_trait]
pub trait SpotExchange: Send + Sync {
    /// Fetch the full symbol list with trading rules.
    async fn get_symbols(&self) -> ExchangeResult<Vec<SymbolRule>>;

    /// Ticker for one symbol.
    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Batched tickers for every listed symbol.
    async fn get_all_tickers(&self) -> ExchangeResult<Vec<Ticker>>;

    /// Most recent closed candles, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Free/locked balances per asset.
    async fn get_balances(&self) -> ExchangeResult<HashMap<String, AssetBalance>>;

    /// All orders currently resting on the book.
    async fn get_open_orders(&self) -> ExchangeResult<Vec<OpenOrder>>;

    /// Fills since the given time, oldest first.
    async fn get_filled_orders(&self, since: DateTime<Utc>) -> ExchangeResult<Vec<FilledOrder>>;

    /// Place an order; returns the exchange order id.
    async fn place_order(&self, order: &NewOrder) -> ExchangeResult<String>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<CancelStatus>;

    /// Look up one order by id. `None` when the exchange no longer knows it.
    async fn get_order(&self, order_id: &str, symbol: &str)
        -> ExchangeResult<Option<OrderDetail>>;

    /// Convenience: last trade price for a symbol.
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.get_ticker(symbol).await?.price)
    }
}
