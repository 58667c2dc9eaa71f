//! Cross-exchange price lead signal.
//!
//! A reference venue that trades ahead of the home exchange leaks
//! short-horizon direction: when the reference price leads by more than
//! the threshold the home price tends to follow.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MarketView, Signal, SignalSource};

/// Minimum lead treated as meaningful (0.2%).
const LEAD_THRESHOLD: Decimal = dec!(0.002);

/// Lead observation and its direction.
#[derive(Debug, Clone, Copy)]
pub struct LeadRead {
    /// (reference - home) / home
    pub lead: Decimal,
    pub leading_up: bool,
}

/// Watches reference-venue prices fed in by an external monitor.
pub struct CrossExchangeLead {
    reference_prices: RwLock<HashMap<String, Decimal>>,
}

impl Default for CrossExchangeLead {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossExchangeLead {
    pub fn new() -> Self {
        Self {
            reference_prices: RwLock::new(HashMap::new()),
        }
    }

    /// Record the latest reference-venue price for a symbol.
    pub async fn update_reference(&self, symbol: &str, price: Decimal) {
        self.reference_prices
            .write()
            .await
            .insert(symbol.to_string(), price);
    }

    /// Current lead for a symbol, if a reference price is known.
    pub async fn lead(&self, symbol: &str, home_price: Decimal) -> Option<LeadRead> {
        if home_price <= Decimal::ZERO {
            return None;
        }
        let reference = *self.reference_prices.read().await.get(symbol)?;
        let lead = (reference - home_price) / home_price;
        Some(LeadRead {
            lead,
            leading_up: lead > Decimal::ZERO,
        })
    }
}

#[async_trait]
impl SignalSource for CrossExchangeLead {
    fn id(&self) -> &'static str {
        "cross_exchange_lead"
    }

    async fn score(&self, symbol: &str, view: &MarketView) -> Signal {
        let Some(read) = self.lead(symbol, view.ticker.price).await else {
            return Signal::neutral(self.id(), symbol);
        };

        if read.lead.abs() < LEAD_THRESHOLD {
            return Signal::new(self.id(), symbol, 50.0, 0.5);
        }

        // Scale the score with lead magnitude, saturating at 5x threshold
        let magnitude = (read.lead.abs() / LEAD_THRESHOLD)
            .to_f64()
            .unwrap_or(1.0)
            .min(5.0);
        let push = 10.0 * magnitude;
        let score = if read.leading_up {
            50.0 + push
        } else {
            50.0 - push
        };

        Signal::new(self.id(), symbol, score, 0.9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Ticker;

    fn view(price: Decimal) -> MarketView {
        MarketView {
            ticker: Ticker {
                symbol: "TEST-USDT".to_string(),
                price,
                best_bid: price,
                best_ask: price,
                volume_24h: dec!(1_000_000),
                change_24h: Decimal::ZERO,
            },
            candles: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_no_reference_price_is_neutral() {
        let lead = CrossExchangeLead::new();
        let signal = lead.score("TEST-USDT", &view(dec!(100))).await;
        assert_eq!(signal.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_reference_leading_up_scores_bullish() {
        let lead = CrossExchangeLead::new();
        lead.update_reference("TEST-USDT", dec!(101)).await; // +1% lead
        let signal = lead.score("TEST-USDT", &view(dec!(100))).await;
        assert!(signal.score > 80.0, "score {}", signal.score);
    }

    #[tokio::test]
    async fn test_reference_leading_down_scores_bearish() {
        let lead = CrossExchangeLead::new();
        lead.update_reference("TEST-USDT", dec!(99)).await;
        let signal = lead.score("TEST-USDT", &view(dec!(100))).await;
        assert!(signal.score < 20.0, "score {}", signal.score);
    }

    #[tokio::test]
    async fn test_sub_threshold_lead_is_flat() {
        let lead = CrossExchangeLead::new();
        lead.update_reference("TEST-USDT", dec!(100.1)).await; // 0.1% < threshold
        let signal = lead.score("TEST-USDT", &view(dec!(100))).await;
        assert_eq!(signal.score, 50.0);
    }
}
