//! Signal fetchers.
//!
//! Every fetcher produces a bounded, timestamped [`Signal`]. A fetcher that
//! fails returns the neutral signal (score 50, confidence 0) instead of an
//! error: one dead source must never stall the scan.
//!
//! - `technical`: indicator battery over candles
//! - `multi_timeframe`: trend agreement across 1m/5m/15m/1h
//! - `sentiment`: aggregator over pluggable external sources
//! - `onchain`: discrete whale/flow activity buckets
//! - `cross_exchange`: reference-venue price lead

pub mod cross_exchange;
pub mod multi_timeframe;
pub mod onchain;
pub mod sentiment;
pub mod technical;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::exchange::{Candle, Ticker, Timeframe};

/// A bounded score emitted by one signal source.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Source id, e.g. "technical" or "whale_flow"
    pub source: &'static str,
    pub symbol: String,
    /// Score in [0, 100]; 50 is neutral
    pub score: f64,
    /// Confidence in [0, 1]; 0 means "ignore me"
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(source: &'static str, symbol: &str, score: f64, confidence: f64) -> Self {
        Self {
            source,
            symbol: symbol.to_string(),
            score: score.clamp(0.0, 100.0),
            confidence: confidence.clamp(0.0, 1.0),
            generated_at: Utc::now(),
        }
    }

    /// The neutral signal a failed fetcher degrades to.
    pub fn neutral(source: &'static str, symbol: &str) -> Self {
        Self::new(source, symbol, 50.0, 0.0)
    }

    /// Stale signals are ignored by the scorer.
    pub fn is_fresh(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        now - self.generated_at <= Duration::seconds(ttl_secs as i64)
    }
}

/// Per-symbol market data handed to the fetchers each cycle.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub ticker: Ticker,
    pub candles: HashMap<Timeframe, Vec<Candle>>,
}

impl MarketView {
    pub fn candles(&self, timeframe: Timeframe) -> &[Candle] {
        self.candles.get(&timeframe).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Close prices for a timeframe as f64, oldest first.
    pub fn closes(&self, timeframe: Timeframe) -> Vec<f64> {
        self.candles(timeframe)
            .iter()
            .filter_map(|c| c.close.to_f64())
            .collect()
    }
}

/// A pluggable external signal source (sentiment feed, on-chain monitor,
/// reference-venue watcher). Implementations must degrade to
/// [`Signal::neutral`] instead of failing.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn id(&self) -> &'static str;

    async fn score(&self, symbol: &str, view: &MarketView) -> Signal;
}

/// Map 24h quote volume onto a bounded score. Volume at the eligibility
/// floor scores 50; each decade above adds 25 points.
pub fn volume_score(volume_24h: Decimal, min_volume: Decimal) -> f64 {
    let volume = volume_24h.to_f64().unwrap_or(0.0);
    let floor = min_volume.to_f64().unwrap_or(1.0).max(1.0);
    if volume <= 0.0 {
        return 0.0;
    }
    (50.0 + 25.0 * (volume / floor).log10()).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signal_clamps_bounds() {
        let signal = Signal::new("technical", "BTC-USDT", 140.0, 1.5);
        assert_eq!(signal.score, 100.0);
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn test_neutral_signal() {
        let signal = Signal::neutral("sentiment", "ETH-USDT");
        assert_eq!(signal.score, 50.0);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_signal_freshness() {
        let mut signal = Signal::neutral("technical", "BTC-USDT");
        let now = Utc::now();
        assert!(signal.is_fresh(60, now));
        signal.generated_at = now - Duration::seconds(61);
        assert!(!signal.is_fresh(60, now));
    }

    #[test]
    fn test_volume_score_scaling() {
        let floor = dec!(50_000);
        assert_eq!(volume_score(floor, floor), 50.0);
        assert_eq!(volume_score(dec!(5_000_000), floor), 100.0);
        assert!(volume_score(dec!(5_000), floor) < 50.0);
        assert_eq!(volume_score(Decimal::ZERO, floor), 0.0);
    }
}
