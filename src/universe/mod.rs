//! Symbol universe and trading-rule cache.
//!
//! Maintains the set of tradable symbols with their tick/lot/min-notional
//! rules. Rules survive restarts through a durable cache, and a refresh
//! whose payload omits increments for a known symbol keeps the cached
//! values (partial rule payloads are a known exchange failure mode).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::FilterConfig;
use crate::exchange::{ExchangeError, ExchangeResult, SpotExchange, SymbolRule};
use crate::utils::fs::durable_write;

const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RuleCacheFile {
    schema_version: u32,
    updated_at: DateTime<Utc>,
    rules: Vec<SymbolRule>,
}

/// Current set of eligible symbols and their exchange rules.
pub struct SymbolUniverse {
    rules: HashMap<String, SymbolRule>,
    filter: FilterConfig,
    quote_currency: String,
    cache_path: PathBuf,
    /// Raised when the last refresh failed and the cache is serving stale rules
    degraded: bool,
}

impl SymbolUniverse {
    /// Create a universe, loading any cached rules from disk.
    pub fn new(filter: FilterConfig, quote_currency: String, cache_path: PathBuf) -> Self {
        let mut universe = Self {
            rules: HashMap::new(),
            filter,
            quote_currency,
            cache_path,
            degraded: false,
        };
        universe.load_cache();
        universe
    }

    fn load_cache(&mut self) {
        let bytes = match std::fs::read(&self.cache_path) {
            Ok(b) => b,
            Err(_) => return,
        };
        match serde_json::from_slice::<RuleCacheFile>(&bytes) {
            Ok(cache) => {
                info!(
                    symbols = cache.rules.len(),
                    updated_at = %cache.updated_at,
                    "Loaded symbol rules from cache"
                );
                self.rules = cache
                    .rules
                    .into_iter()
                    .map(|r| (r.symbol.clone(), r))
                    .collect();
            }
            Err(e) => warn!(error = %e, "Symbol rule cache unreadable, starting empty"),
        }
    }

    fn persist_cache(&self) -> Result<()> {
        let cache = RuleCacheFile {
            schema_version: CACHE_SCHEMA_VERSION,
            updated_at: Utc::now(),
            rules: self.rules.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&cache).context("Failed to serialize rule cache")?;
        durable_write(&self.cache_path, &bytes)
    }

    /// True when a base asset is purely numeric (leveraged-token style
    /// listings the agent never trades).
    fn is_numeric_base(base: &str) -> bool {
        !base.is_empty() && base.chars().all(|c| c.is_ascii_digit())
    }

    fn is_eligible(&self, rule: &SymbolRule) -> bool {
        rule.active
            && rule.quote_asset == self.quote_currency
            && !self.filter.ignored_symbols.contains(&rule.symbol)
            && !self.filter.stablecoins.contains(&rule.base_asset)
            && !Self::is_numeric_base(&rule.base_asset)
    }

    /// Pull the full symbol list and replace the cached set atomically.
    ///
    /// On upstream failure the previous cache is retained and the universe
    /// reports itself degraded until the next successful refresh.
    pub async fn refresh(&mut self, exchange: &dyn SpotExchange) -> Result<()> {
        let fetched = match exchange.get_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                self.degraded = true;
                warn!(error = %e, cached = self.rules.len(), "Symbol refresh failed, keeping cache");
                return Err(e.into());
            }
        };

        let mut next: HashMap<String, SymbolRule> = HashMap::new();
        let mut preserved = 0usize;

        for mut rule in fetched {
            if !self.is_eligible(&rule) {
                continue;
            }

            // Merge-with-preserve: a refresh that drops tick or lot for a
            // symbol we already know is a transient upstream defect.
            if let Some(prev) = self.rules.get(&rule.symbol) {
                if rule.tick_size <= Decimal::ZERO {
                    rule.tick_size = prev.tick_size;
                    preserved += 1;
                }
                if rule.lot_size <= Decimal::ZERO {
                    rule.lot_size = prev.lot_size;
                    preserved += 1;
                }
                if rule.min_notional <= Decimal::ZERO {
                    rule.min_notional = prev.min_notional;
                    preserved += 1;
                }
            }

            // A symbol with no usable increments cannot be traded safely
            if rule.tick_size <= Decimal::ZERO || rule.lot_size <= Decimal::ZERO {
                continue;
            }

            next.insert(rule.symbol.clone(), rule);
        }

        let added = next.keys().filter(|k| !self.rules.contains_key(*k)).count();
        let removed = self.rules.keys().filter(|k| !next.contains_key(*k)).count();

        self.rules = next;
        self.degraded = false;

        info!(
            eligible = self.rules.len(),
            added,
            removed,
            preserved_fields = preserved,
            "Symbol universe refreshed"
        );

        if let Err(e) = self.persist_cache() {
            warn!(error = %e, "Failed to persist symbol rule cache");
        }
        Ok(())
    }

    /// Trading rules for one symbol.
    pub fn rules(&self, symbol: &str) -> ExchangeResult<&SymbolRule> {
        self.rules
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    /// Snapshot of all eligible symbol keys.
    pub fn all(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Drop a symbol from the eligible set (e.g. after UnknownSymbol errors).
    pub fn remove(&mut self, symbol: &str) {
        if self.rules.remove(symbol).is_some() {
            warn!(symbol, "Symbol removed from universe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn universe(dir: &std::path::Path) -> SymbolUniverse {
        SymbolUniverse::new(
            FilterConfig::default(),
            "USDT".to_string(),
            dir.join("rules.json"),
        )
    }

    fn rule(symbol: &str, tick: Decimal, lot: Decimal) -> SymbolRule {
        let (base, quote) = symbol.split_once('-').unwrap();
        SymbolRule {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            tick_size: tick,
            lot_size: lot,
            min_notional: dec!(1),
            active: true,
            refreshed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_refresh_filters_ineligible_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.set_rule(rule("BTC-USDT", dec!(0.1), dec!(0.0001))).await;
        exchange.set_rule(rule("USDC-USDT", dec!(0.0001), dec!(0.01))).await; // stablecoin base
        exchange.set_rule(rule("ETH-BTC", dec!(0.00001), dec!(0.001))).await; // quote mismatch
        let mut inactive = rule("DOGE-USDT", dec!(0.00001), dec!(1));
        inactive.active = false;
        exchange.set_rule(inactive).await;

        let mut universe = universe(dir.path());
        universe.refresh(&exchange).await.unwrap();

        assert_eq!(universe.all(), vec!["BTC-USDT".to_string()]);
        assert!(!universe.is_degraded());
    }

    #[tokio::test]
    async fn test_numeric_bases_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.set_rule(rule("1000-USDT", dec!(0.001), dec!(1))).await;
        exchange.set_rule(rule("SOL-USDT", dec!(0.001), dec!(0.01))).await;

        let mut universe = universe(dir.path());
        universe.refresh(&exchange).await.unwrap();

        assert_eq!(universe.all(), vec!["SOL-USDT".to_string()]);
    }

    #[tokio::test]
    async fn test_partial_payload_preserves_prior_increments() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.set_rule(rule("BTC-USDT", dec!(0.1), dec!(0.0001))).await;

        let mut universe = universe(dir.path());
        universe.refresh(&exchange).await.unwrap();

        // Second refresh drops the increments
        exchange.set_rule(rule("BTC-USDT", Decimal::ZERO, Decimal::ZERO)).await;
        universe.refresh(&exchange).await.unwrap();

        let rule = universe.rules("BTC-USDT").unwrap();
        assert_eq!(rule.tick_size, dec!(0.1));
        assert_eq!(rule.lot_size, dec!(0.0001));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_cache_and_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.set_rule(rule("BTC-USDT", dec!(0.1), dec!(0.0001))).await;

        let mut universe = universe(dir.path());
        universe.refresh(&exchange).await.unwrap();

        exchange
            .fail_next(
                crate::exchange::MockOp::Symbols,
                ExchangeError::Unavailable("maintenance".to_string()),
            )
            .await;
        assert!(universe.refresh(&exchange).await.is_err());
        assert!(universe.is_degraded());
        assert_eq!(universe.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_survive_restart_via_cache() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = MockExchange::new();
        exchange.set_rule(rule("BTC-USDT", dec!(0.1), dec!(0.0001))).await;

        {
            let mut universe = universe(dir.path());
            universe.refresh(&exchange).await.unwrap();
        }

        let restarted = universe(dir.path());
        assert!(restarted.rules("BTC-USDT").is_ok());
    }

    #[test]
    fn test_unknown_symbol_error() {
        let dir = tempfile::tempdir().unwrap();
        let universe = universe(dir.path());
        assert!(matches!(
            universe.rules("NOPE-USDT"),
            Err(ExchangeError::UnknownSymbol(_))
        ));
    }
}
