//! Learning memory: realized outcomes folded into adaptive buckets.
//!
//! Every close increments the `(regime at entry, strategy)` bucket and the
//! per-symbol bucket. Counters are monotonic and deduplicated by trade id,
//! so replaying the ledger after a crash cannot double-count. The scorer
//! reads these buckets to promote, demote or avoid candidates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::ledger::CloseReason;
use crate::regime::Regime;
use crate::utils::fs::durable_write;

const LEARNING_SCHEMA_VERSION: u32 = 1;

/// Monotonic outcome counters for one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BucketStats {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }

    fn fold(&mut self, pnl: Decimal) {
        self.trades += 1;
        if pnl > Decimal::ZERO {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.realized_pnl += pnl;
        self.last_updated = Some(Utc::now());
    }

    fn merge(&mut self, other: &BucketStats) {
        self.trades += other.trades;
        self.wins += other.wins;
        self.losses += other.losses;
        self.realized_pnl += other.realized_pnl;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LearningFile {
    schema_version: u32,
    by_bucket: HashMap<String, BucketStats>,
    by_symbol: HashMap<String, BucketStats>,
    seen_trades: HashSet<String>,
    total_cycles: u64,
    updated_at: DateTime<Utc>,
}

/// Durable per-(regime, strategy) and per-symbol outcome memory.
pub struct LearningMemory {
    by_bucket: HashMap<String, BucketStats>,
    by_symbol: HashMap<String, BucketStats>,
    seen_trades: HashSet<String>,
    total_cycles: u64,
    path: Option<PathBuf>,
}

fn bucket_key(regime: Regime, strategy: CloseReason) -> String {
    format!("{}|{}", regime.as_str(), strategy.as_str())
}

impl LearningMemory {
    /// Volatile memory for tests and paper experiments.
    pub fn in_memory() -> Self {
        Self {
            by_bucket: HashMap::new(),
            by_symbol: HashMap::new(),
            seen_trades: HashSet::new(),
            total_cycles: 0,
            path: None,
        }
    }

    /// Load from the durable learning file, starting fresh if absent.
    pub fn load(path: PathBuf) -> Self {
        let mut memory = Self {
            by_bucket: HashMap::new(),
            by_symbol: HashMap::new(),
            seen_trades: HashSet::new(),
            total_cycles: 0,
            path: Some(path.clone()),
        };

        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<LearningFile>(&bytes) {
                Ok(file) => {
                    info!(
                        buckets = file.by_bucket.len(),
                        symbols = file.by_symbol.len(),
                        trades = file.seen_trades.len(),
                        "Learning memory loaded"
                    );
                    memory.by_bucket = file.by_bucket;
                    memory.by_symbol = file.by_symbol;
                    memory.seen_trades = file.seen_trades;
                    memory.total_cycles = file.total_cycles;
                }
                Err(e) => warn!(error = %e, "Learning file corrupt, starting fresh"),
            },
            Err(_) => debug!("No learning file yet"),
        }

        memory
    }

    /// Fold one realized close into the buckets. Idempotent per trade id.
    /// Returns false when the trade was already folded.
    pub fn record_close(
        &mut self,
        trade_id: &str,
        regime: Regime,
        strategy: CloseReason,
        symbol: &str,
        realized_pnl: Decimal,
    ) -> bool {
        if !self.seen_trades.insert(trade_id.to_string()) {
            debug!(trade_id, "Close already folded, skipping");
            return false;
        }

        self.by_bucket
            .entry(bucket_key(regime, strategy))
            .or_default()
            .fold(realized_pnl);
        self.by_symbol
            .entry(symbol.to_string())
            .or_default()
            .fold(realized_pnl);

        debug!(
            trade_id,
            regime = %regime,
            strategy = %strategy,
            symbol,
            pnl = %realized_pnl,
            "Outcome folded into learning memory"
        );
        true
    }

    /// Win rate for an exact (regime, strategy) bucket.
    pub fn win_rate(&self, regime: Regime, strategy: CloseReason) -> Option<f64> {
        self.by_bucket
            .get(&bucket_key(regime, strategy))
            .filter(|b| b.trades > 0)
            .map(|b| b.win_rate())
    }

    /// Aggregate stats across all strategies within one regime.
    pub fn regime_stats(&self, regime: Regime) -> BucketStats {
        let prefix = format!("{}|", regime.as_str());
        let mut total = BucketStats::default();
        for (key, stats) in &self.by_bucket {
            if key.starts_with(&prefix) {
                total.merge(stats);
            }
        }
        total
    }

    /// Strategies ordered by realized win rate within a regime.
    pub fn best_strategies(&self, regime: Regime) -> Vec<(CloseReason, f64)> {
        let prefix = format!("{}|", regime.as_str());
        let mut out: Vec<(CloseReason, f64)> = self
            .by_bucket
            .iter()
            .filter(|(key, stats)| key.starts_with(&prefix) && stats.trades > 0)
            .filter_map(|(key, stats)| {
                let strategy = CloseReason::from_str(key.strip_prefix(&prefix)?).ok()?;
                Some((strategy, stats.win_rate()))
            })
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("win rates are finite"));
        out
    }

    /// A symbol is avoided once it has a proven poor record.
    pub fn avoid(&self, symbol: &str) -> bool {
        self.by_symbol
            .get(symbol)
            .map(|s| s.trades >= 10 && s.win_rate() < 0.25)
            .unwrap_or(false)
    }

    pub fn symbol_stats(&self, symbol: &str) -> Option<&BucketStats> {
        self.by_symbol.get(symbol)
    }

    /// Count one agent cycle (diagnostic).
    pub fn tick_cycle(&mut self) {
        self.total_cycles += 1;
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Durable atomic write of the learning file.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = LearningFile {
            schema_version: LEARNING_SCHEMA_VERSION,
            by_bucket: self.by_bucket.clone(),
            by_symbol: self.by_symbol.clone(),
            seen_trades: self.seen_trades.clone(),
            total_cycles: self.total_cycles,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("Failed to serialize learning")?;
        durable_write(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fold_and_win_rate() {
        let mut memory = LearningMemory::in_memory();
        memory.record_close("t1", Regime::Normal, CloseReason::TakeProfit, "BTC-USDT", dec!(1));
        memory.record_close("t2", Regime::Normal, CloseReason::TakeProfit, "BTC-USDT", dec!(2));
        memory.record_close("t3", Regime::Normal, CloseReason::StopLoss, "BTC-USDT", dec!(-1));

        assert_eq!(memory.win_rate(Regime::Normal, CloseReason::TakeProfit), Some(1.0));
        assert_eq!(memory.win_rate(Regime::Normal, CloseReason::StopLoss), Some(0.0));
        assert_eq!(memory.win_rate(Regime::Bull, CloseReason::TakeProfit), None);

        let stats = memory.regime_stats(Regime::Normal);
        assert_eq!(stats.trades, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.realized_pnl, dec!(2));
    }

    #[test]
    fn test_dedupe_by_trade_id() {
        let mut memory = LearningMemory::in_memory();
        assert!(memory.record_close("t1", Regime::Normal, CloseReason::TakeProfit, "X-USDT", dec!(1)));
        assert!(!memory.record_close("t1", Regime::Normal, CloseReason::TakeProfit, "X-USDT", dec!(1)));

        let stats = memory.regime_stats(Regime::Normal);
        assert_eq!(stats.trades, 1);
    }

    #[test]
    fn test_best_strategies_ordering() {
        let mut memory = LearningMemory::in_memory();
        for i in 0..4 {
            memory.record_close(
                &format!("tp-{i}"),
                Regime::Bull,
                CloseReason::TakeProfit,
                "X-USDT",
                dec!(1),
            );
        }
        for i in 0..4 {
            let pnl = if i == 0 { dec!(0.5) } else { dec!(-0.5) };
            memory.record_close(
                &format!("rc-{i}"),
                Regime::Bull,
                CloseReason::RecycleProfit,
                "X-USDT",
                pnl,
            );
        }

        let best = memory.best_strategies(Regime::Bull);
        assert_eq!(best[0].0, CloseReason::TakeProfit);
        assert_eq!(best[0].1, 1.0);
        assert_eq!(best[1].0, CloseReason::RecycleProfit);
    }

    #[test]
    fn test_avoid_needs_sample_and_poor_record() {
        let mut memory = LearningMemory::in_memory();
        for i in 0..9 {
            memory.record_close(
                &format!("t{i}"),
                Regime::Normal,
                CloseReason::StopLoss,
                "DUD-USDT",
                dec!(-1),
            );
        }
        // 9 trades: below the sample floor
        assert!(!memory.avoid("DUD-USDT"));

        memory.record_close("t9", Regime::Normal, CloseReason::StopLoss, "DUD-USDT", dec!(-1));
        assert!(memory.avoid("DUD-USDT"));
        assert!(!memory.avoid("OTHER-USDT"));
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");

        {
            let mut memory = LearningMemory::load(path.clone());
            memory.record_close("t1", Regime::Bull, CloseReason::TakeProfit, "BTC-USDT", dec!(3));
            memory.tick_cycle();
            memory.persist().unwrap();
        }

        let reloaded = LearningMemory::load(path);
        assert_eq!(reloaded.win_rate(Regime::Bull, CloseReason::TakeProfit), Some(1.0));
        assert_eq!(reloaded.total_cycles(), 1);
        // Idempotence survives restart
        let mut reloaded = reloaded;
        assert!(!reloaded.record_close("t1", Regime::Bull, CloseReason::TakeProfit, "BTC-USDT", dec!(3)));
    }
}
