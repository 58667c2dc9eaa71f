//! Market regime detection.
//!
//! Classifies the whole market into one of eight regimes from the
//! distribution of 24h returns across a representative top-by-volume
//! sample. Transitions are smoothed with two-cycle hysteresis, except
//! moves into `StrongBear` or `Volatile` which take effect immediately
//! (risk reduction must not lag).

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::exchange::Ticker;

/// Sample size below which the detector refuses to classify.
const MIN_SAMPLE: usize = 10;
/// Return dispersion (p90 - p10) that marks the market volatile.
const DISPERSION_THRESHOLD: f64 = 0.20;

/// Market regime classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    StrongBull,
    Bull,
    Normal,
    Volatile,
    Flat,
    Bear,
    StrongBear,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::StrongBull => "STRONG_BULL",
            Regime::Bull => "BULL",
            Regime::Normal => "NORMAL",
            Regime::Volatile => "VOLATILE",
            Regime::Flat => "FLAT",
            Regime::Bear => "BEAR",
            Regime::StrongBear => "STRONG_BEAR",
            Regime::Unknown => "UNKNOWN",
        }
    }

    /// Position-size multiplier applied on top of tier sizing.
    pub fn size_multiplier(&self) -> rust_decimal::Decimal {
        use rust_decimal_macros::dec;
        match self {
            Regime::StrongBull => dec!(1.25),
            Regime::Bull => dec!(1.10),
            Regime::Normal => dec!(1.00),
            Regime::Volatile => dec!(0.75),
            Regime::Bear => dec!(0.50),
            Regime::StrongBear => dec!(0.00),
            Regime::Flat => dec!(0.75),
            Regime::Unknown => dec!(0.50),
        }
    }

    /// Regimes that bypass transition hysteresis.
    fn is_urgent(&self) -> bool {
        matches!(self, Regime::StrongBear | Regime::Volatile)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classification with its diagnostic scalars.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeRead {
    pub regime: Regime,
    /// Median 24h return across the sample
    pub momentum: f64,
    /// Standard deviation of 24h returns
    pub volatility: f64,
    /// Fraction of symbols agreeing with the majority direction
    pub consistency: f64,
}

impl RegimeRead {
    pub fn unknown() -> Self {
        Self {
            regime: Regime::Unknown,
            momentum: 0.0,
            volatility: 0.0,
            consistency: 0.0,
        }
    }
}

/// Stateful detector applying hysteresis across cycles.
pub struct RegimeDetector {
    sample_size: usize,
    current: RegimeRead,
    /// Candidate regime waiting for confirmation, with its streak length
    pending: Option<(Regime, u32)>,
}

impl RegimeDetector {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size,
            current: RegimeRead::unknown(),
            pending: None,
        }
    }

    pub fn current(&self) -> RegimeRead {
        self.current
    }

    /// Classify from the latest batched tickers. Called at most once per
    /// cycle by the detection phase.
    pub fn update(&mut self, tickers: &[Ticker]) -> RegimeRead {
        let raw = self.classify(tickers);
        let adopted = self.apply_hysteresis(raw.regime);

        self.current = RegimeRead {
            regime: adopted,
            ..raw
        };

        debug!(
            regime = %self.current.regime,
            raw = %raw.regime,
            momentum = self.current.momentum,
            volatility = self.current.volatility,
            consistency = self.current.consistency,
            "Regime updated"
        );
        self.current
    }

    fn apply_hysteresis(&mut self, raw: Regime) -> Regime {
        if raw == self.current.regime {
            self.pending = None;
            return raw;
        }
        if raw.is_urgent() {
            if self.current.regime != raw {
                info!(from = %self.current.regime, to = %raw, "Urgent regime transition");
            }
            self.pending = None;
            return raw;
        }

        match self.pending.take() {
            Some((candidate, streak)) if candidate == raw => {
                // Second consecutive cycle in the new regime: adopt it
                if streak + 1 >= 2 {
                    info!(from = %self.current.regime, to = %raw, "Regime transition confirmed");
                    return raw;
                }
                self.pending = Some((candidate, streak + 1));
                self.current.regime
            }
            _ => {
                self.pending = Some((raw, 1));
                self.current.regime
            }
        }
    }

    fn classify(&self, tickers: &[Ticker]) -> RegimeRead {
        // Top-N by volume forms the representative sample
        let mut sample: Vec<&Ticker> = tickers.iter().collect();
        sample.sort_by(|a, b| b.volume_24h.cmp(&a.volume_24h));
        sample.truncate(self.sample_size);

        let mut returns: Vec<f64> = sample
            .iter()
            .filter_map(|t| t.change_24h.to_f64())
            .collect();

        if returns.len() < MIN_SAMPLE {
            return RegimeRead::unknown();
        }

        returns.sort_by(|a, b| a.partial_cmp(b).expect("no NaN returns"));
        let n = returns.len();
        let median = if n % 2 == 0 {
            (returns[n / 2 - 1] + returns[n / 2]) / 2.0
        } else {
            returns[n / 2]
        };

        let mean = returns.iter().sum::<f64>() / n as f64;
        let volatility =
            (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n as f64).sqrt();

        let positive = returns.iter().filter(|r| **r > 0.0).count();
        let negative = returns.iter().filter(|r| **r < 0.0).count();
        let consistency = positive.max(negative) as f64 / n as f64;

        let dispersion = returns[(n as f64 * 0.9) as usize % n] - returns[(n as f64 * 0.1) as usize];

        let regime = if median >= 0.05 && consistency >= 0.70 {
            Regime::StrongBull
        } else if median >= 0.01 && consistency >= 0.55 {
            Regime::Bull
        } else if median.abs() < 0.01 && volatility < 0.02 {
            Regime::Flat
        } else if volatility > 0.08 || dispersion > DISPERSION_THRESHOLD {
            Regime::Volatile
        } else if median <= -0.05 && consistency >= 0.70 {
            Regime::StrongBear
        } else if median <= -0.01 {
            Regime::Bear
        } else {
            Regime::Normal
        };

        RegimeRead {
            regime,
            momentum: median,
            volatility,
            consistency,
        }
    }
}
