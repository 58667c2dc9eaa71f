//! Unified opportunity scoring.
//!
//! Folds the per-symbol signal set into one composite score with
//! regime-adaptive weights, assigns a quality tier, and returns the top-K
//! opportunities for the cycle. Learning memory modulates tiers: buckets
//! with a poor realized win-rate demote an opportunity one tier, proven
//! buckets promote it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::learning::LearningMemory;
use crate::regime::Regime;
use crate::signals::technical::TechnicalRead;

/// Discrete quality band; drives position sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    GodTier,
    HighConfidence,
    StrongSetup,
    Good,
    Standard,
}

impl Tier {
    /// Tier from a composite score; `None` below the entry threshold.
    pub fn from_score(score: f64) -> Option<Tier> {
        if score >= 95.0 {
            Some(Tier::GodTier)
        } else if score >= 90.0 {
            Some(Tier::HighConfidence)
        } else if score >= 85.0 {
            Some(Tier::StrongSetup)
        } else if score >= 80.0 {
            Some(Tier::Good)
        } else if score >= 70.0 {
            Some(Tier::Standard)
        } else {
            None
        }
    }

    /// Size multiplier over the base position.
    pub fn size_multiplier(&self) -> Decimal {
        use rust_decimal_macros::dec;
        match self {
            Tier::GodTier => dec!(4.0),
            Tier::HighConfidence => dec!(3.0),
            Tier::StrongSetup => dec!(2.0),
            Tier::Good => dec!(1.5),
            Tier::Standard => dec!(1.0),
        }
    }

    fn promote(&self) -> Tier {
        match self {
            Tier::Standard => Tier::Good,
            Tier::Good => Tier::StrongSetup,
            Tier::StrongSetup => Tier::HighConfidence,
            Tier::HighConfidence | Tier::GodTier => Tier::GodTier,
        }
    }

    fn demote(&self) -> Option<Tier> {
        match self {
            Tier::GodTier => Some(Tier::HighConfidence),
            Tier::HighConfidence => Some(Tier::StrongSetup),
            Tier::StrongSetup => Some(Tier::Good),
            Tier::Good => Some(Tier::Standard),
            Tier::Standard => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::GodTier => "GOD_TIER",
            Tier::HighConfidence => "HIGH_CONFIDENCE",
            Tier::StrongSetup => "STRONG_SETUP",
            Tier::Good => "GOOD",
            Tier::Standard => "STANDARD",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component weights; always sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct ComponentWeights {
    pub technical: f64,
    pub intelligence: f64,
    pub multi_timeframe: f64,
    pub volume: f64,
    pub sentiment: f64,
}

impl ComponentWeights {
    /// Regime-adaptive weights. Volatile and crashing markets trust raw
    /// technicals less and confirmation more; strong bulls lean harder on
    /// timeframe alignment.
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Volatile | Regime::StrongBear => Self {
                technical: 0.30,
                intelligence: 0.30,
                multi_timeframe: 0.20,
                volume: 0.10,
                sentiment: 0.10,
            },
            Regime::StrongBull => Self {
                technical: 0.40,
                intelligence: 0.30,
                multi_timeframe: 0.20,
                volume: 0.10,
                sentiment: 0.00,
            },
            _ => Self {
                technical: 0.40,
                intelligence: 0.30,
                multi_timeframe: 0.15,
                volume: 0.10,
                sentiment: 0.05,
            },
        }
    }

    pub fn sum(&self) -> f64 {
        self.technical + self.intelligence + self.multi_timeframe + self.volume + self.sentiment
    }
}

/// Per-symbol signal set collected by the scan phase.
#[derive(Debug, Clone)]
pub struct SymbolAnalysis {
    pub symbol: String,
    pub price: Decimal,
    pub spread: Decimal,
    pub volume_24h: Decimal,
    pub technical: TechnicalRead,
    pub multi_timeframe: f64,
    pub intelligence: f64,
    pub sentiment: f64,
    pub volume_score: f64,
}

/// A scored, tiered candidate for this cycle.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub composite: f64,
    pub technical: f64,
    pub intelligence: f64,
    pub multi_timeframe: f64,
    pub volume: f64,
    pub sentiment: f64,
    pub tier: Tier,
    pub price: Decimal,
    pub spread: Decimal,
    pub volume_24h: Decimal,
    /// ATR as fraction of price, carried through to stop sizing
    pub atr_pct: f64,
    /// Short tag describing why the tier landed where it did
    pub rationale: String,
}

/// Regime-aware scorer.
pub struct UnifiedScorer {
    top_k: usize,
}

/// Composite score for one analysis under a regime's weights.
pub fn composite_score(analysis: &SymbolAnalysis, regime: Regime) -> f64 {
    let weights = ComponentWeights::for_regime(regime);
    analysis.technical.score * weights.technical
        + analysis.intelligence * weights.intelligence
        + analysis.multi_timeframe * weights.multi_timeframe
        + analysis.volume_score * weights.volume
        + analysis.sentiment * weights.sentiment
}

impl UnifiedScorer {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    /// Score all analyzed symbols and return the top-K admissible
    /// opportunities, best first.
    pub fn rank(
        &self,
        analyses: &[SymbolAnalysis],
        regime: Regime,
        learning: &LearningMemory,
    ) -> Vec<Opportunity> {
        debug_assert!((ComponentWeights::for_regime(regime).sum() - 1.0).abs() < 1e-9);

        let mut opportunities: Vec<Opportunity> = analyses
            .iter()
            .filter_map(|a| self.score_one(a, regime, learning))
            .collect();

        // Composite descending; ties broken by technical subscore, then by
        // 24h volume so ordering is fully deterministic.
        opportunities.sort_by(|a, b| {
            b.composite
                .partial_cmp(&a.composite)
                .expect("scores are finite")
                .then(
                    b.technical
                        .partial_cmp(&a.technical)
                        .expect("scores are finite"),
                )
                .then(b.volume_24h.cmp(&a.volume_24h))
        });
        opportunities.truncate(self.top_k);
        opportunities
    }

    fn score_one(
        &self,
        analysis: &SymbolAnalysis,
        regime: Regime,
        learning: &LearningMemory,
    ) -> Option<Opportunity> {
        if learning.avoid(&analysis.symbol) {
            debug!(symbol = %analysis.symbol, "Skipped: symbol on learning avoid-list");
            return None;
        }

        let composite = composite_score(analysis, regime);

        let base_tier = Tier::from_score(composite)?;
        let (tier, rationale) = self.modulate_tier(base_tier, regime, learning);

        let tier = tier?;
        Some(Opportunity {
            symbol: analysis.symbol.clone(),
            composite,
            technical: analysis.technical.score,
            intelligence: analysis.intelligence,
            multi_timeframe: analysis.multi_timeframe,
            volume: analysis.volume_score,
            sentiment: analysis.sentiment,
            tier,
            price: analysis.price,
            spread: analysis.spread,
            volume_24h: analysis.volume_24h,
            atr_pct: analysis.technical.atr_pct,
            rationale,
        })
    }

    /// Apply learning-memory promotion/demotion to a base tier.
    fn modulate_tier(
        &self,
        base: Tier,
        regime: Regime,
        learning: &LearningMemory,
    ) -> (Option<Tier>, String) {
        let stats = learning.regime_stats(regime);

        if stats.trades >= 5 && stats.win_rate() < 0.30 {
            let demoted = base.demote();
            let rationale = format!("{base} demoted: regime win-rate {:.0}%", stats.win_rate() * 100.0);
            return (demoted, rationale);
        }
        if stats.trades >= 10 && stats.win_rate() >= 0.70 {
            let promoted = base.promote();
            let rationale =
                format!("{base} promoted: regime win-rate {:.0}%", stats.win_rate() * 100.0);
            return (Some(promoted), rationale);
        }
        (Some(base), base.as_str().to_string())
    }
}
