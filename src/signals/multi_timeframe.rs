//! Multi-timeframe trend confirmation.
//!
//! Checks whether the 1m/5m/15m/1h trends agree. Full four-way bullish
//! alignment scores 100; full bearish alignment scores 0.

use crate::exchange::Timeframe;

use super::technical::{trend_direction, Trend};
use super::MarketView;

/// Alignment score plus the per-timeframe trends that produced it.
#[derive(Debug, Clone)]
pub struct MtfRead {
    pub score: f64,
    pub bullish: usize,
    pub bearish: usize,
}

/// Score trend agreement across all configured timeframes.
pub fn alignment(view: &MarketView) -> MtfRead {
    let mut bullish = 0usize;
    let mut bearish = 0usize;

    for timeframe in Timeframe::all() {
        let closes = view.closes(timeframe);
        match trend_direction(&closes) {
            Trend::Bullish => bullish += 1,
            Trend::Bearish => bearish += 1,
            Trend::Neutral => {}
        }
    }

    let score = match (bullish, bearish) {
        (4, _) => 100.0,
        (3, 0) => 80.0,
        (3, _) => 70.0,
        (2, 0) => 65.0,
        (_, 4) => 0.0,
        (0, 3) => 20.0,
        (_, 3) => 30.0,
        (0, 2) => 35.0,
        _ => 50.0,
    };

    MtfRead {
        score,
        bullish,
        bearish,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Candle, Ticker};
    use chrono::Utc;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn series(timeframe: Timeframe, step: f64) -> Vec<Candle> {
        (0..40)
            .map(|i| {
                let close = Decimal::from_f64(100.0 + i as f64 * step).unwrap();
                Candle {
                    symbol: "TEST-USDT".to_string(),
                    timeframe,
                    open_time: Utc::now(),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: dec!(1000),
                }
            })
            .collect()
    }

    fn view(step_by_tf: [f64; 4]) -> MarketView {
        let mut candles = HashMap::new();
        for (timeframe, step) in Timeframe::all().into_iter().zip(step_by_tf) {
            candles.insert(timeframe, series(timeframe, step));
        }
        MarketView {
            ticker: Ticker {
                symbol: "TEST-USDT".to_string(),
                price: dec!(100),
                best_bid: dec!(99.9),
                best_ask: dec!(100.1),
                volume_24h: dec!(1_000_000),
                change_24h: Decimal::ZERO,
            },
            candles,
        }
    }

    #[test]
    fn test_full_alignment_scores_100() {
        let read = alignment(&view([0.5, 0.5, 0.5, 0.5]));
        assert_eq!(read.bullish, 4);
        assert_eq!(read.score, 100.0);
    }

    #[test]
    fn test_full_bearish_alignment_scores_0() {
        let read = alignment(&view([-0.5, -0.5, -0.5, -0.5]));
        assert_eq!(read.bearish, 4);
        assert_eq!(read.score, 0.0);
    }

    #[test]
    fn test_mixed_trends_stay_neutral() {
        let read = alignment(&view([0.5, -0.5, 0.5, -0.5]));
        assert_eq!(read.score, 50.0);
    }

    #[test]
    fn test_missing_timeframes_are_neutral() {
        let view = MarketView {
            ticker: Ticker {
                symbol: "TEST-USDT".to_string(),
                price: dec!(100),
                best_bid: dec!(99.9),
                best_ask: dec!(100.1),
                volume_24h: dec!(1_000_000),
                change_24h: Decimal::ZERO,
            },
            candles: HashMap::new(),
        };
        assert_eq!(alignment(&view).score, 50.0);
    }
}
