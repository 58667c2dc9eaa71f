//! Sentiment aggregation over pluggable external sources.
//!
//! The concrete fetchers (fear/greed indices, social feeds) live outside
//! this crate; anything implementing [`SignalSource`] can be registered.
//! Confidence of the aggregate reflects how many sub-sources were healthy.

use async_trait::async_trait;
use tracing::debug;

use super::{MarketView, Signal, SignalSource};

/// Combines any number of sentiment sources into one signal.
pub struct SentimentAggregator {
    sources: Vec<Box<dyn SignalSource>>,
}

impl SentimentAggregator {
    pub fn new(sources: Vec<Box<dyn SignalSource>>) -> Self {
        Self { sources }
    }

    /// Aggregator with no sources; always neutral.
    pub fn disabled() -> Self {
        Self { sources: Vec::new() }
    }

    /// Confidence-weighted blend of all healthy sub-sources.
    pub async fn score(&self, symbol: &str, view: &MarketView) -> Signal {
        if self.sources.is_empty() {
            return Signal::neutral("sentiment", symbol);
        }

        let mut weighted = 0.0;
        let mut weight = 0.0;
        let mut healthy = 0usize;

        for source in &self.sources {
            let signal = source.score(symbol, view).await;
            if signal.confidence > 0.0 {
                weighted += signal.score * signal.confidence;
                weight += signal.confidence;
                healthy += 1;
            } else {
                debug!(source = source.id(), symbol, "Sentiment source unhealthy");
            }
        }

        if weight == 0.0 {
            return Signal::neutral("sentiment", symbol);
        }

        let confidence = healthy as f64 / self.sources.len() as f64;
        Signal::new("sentiment", symbol, weighted / weight, confidence)
    }
}

/// Map a 0-100 fear/greed index onto a contrarian score: extreme fear is
/// a buying climate, extreme greed is exhaustion.
pub fn fear_greed_score(index: u8) -> f64 {
    match index {
        0..=25 => 70.0,
        26..=45 => 55.0,
        46..=55 => 50.0,
        56..=75 => 45.0,
        _ => 30.0,
    }
}

/// Fixed-value source used in tests and paper runs.
pub struct StaticSentiment {
    pub score: f64,
    pub confidence: f64,
}

#[async_trait]
impl SignalSource for StaticSentiment {
    fn id(&self) -> &'static str {
        "static_sentiment"
    }

    async fn score(&self, symbol: &str, _view: &MarketView) -> Signal {
        Signal::new(self.id(), symbol, self.score, self.confidence)
    }
}
