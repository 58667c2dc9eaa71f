//! Exchange integration.
//!
//! ## KuCoin
//! Typed REST client for the spot API:
//! - Market data (symbols, tickers, candles)
//! - Account operations (balances, orders, fills)
//!
//! ## Mock
//! Full in-memory simulation used for paper trading and tests.

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::KucoinClient;
pub use mock::{MockExchange, MockOp};
pub use traits::SpotExchange;
pub use types::*;
