//! Configuration management for the spot trading agent.
//!
//! Loads settings from environment variables and an optional config file.
//! Flat legacy variables (`PAPER_TRADING`, `MIN_CAPITAL_PER_TRADE`, ...)
//! are applied on top of the structured `SPOT_AGENT__` environment tree so
//! operator overrides keep working across deployments.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KuCoin API credentials
    #[serde(default)]
    pub kucoin: KucoinConfig,
    /// Position sizing and capital limits
    #[serde(default)]
    pub trading: TradingConfig,
    /// Stop-loss, take-profit and circuit-breaker parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Exchange fee model
    #[serde(default)]
    pub fees: FeeConfig,
    /// Cycle cadence and scan fan-out
    #[serde(default)]
    pub scan: ScanConfig,
    /// Symbol universe filters
    #[serde(default)]
    pub filter: FilterConfig,
    /// Execution behavior (pending TTL, decay, recycling)
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Reconciliation cadence and thresholds
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Durable file locations
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct KucoinConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub api_secret: String,
    /// API passphrase (signed alongside requests)
    #[serde(default)]
    pub api_passphrase: String,
    /// Use the sandbox environment instead of production
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Simulate order placement locally instead of calling the exchange
    #[serde(default = "default_paper_trading")]
    pub paper_trading: bool,
    /// Quote currency all pairs must settle in
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Minimum notional per trade in quote currency
    #[serde(default = "default_min_capital_per_trade")]
    pub min_capital_per_trade: Decimal,
    /// Maximum notional per trade in quote currency
    #[serde(default = "default_max_capital_per_trade")]
    pub max_capital_per_trade: Decimal,
    /// Maximum concurrent open positions
    #[serde(default = "default_max_total_positions")]
    pub max_total_positions: usize,
    /// Base fraction of available capital per position (before multipliers)
    #[serde(default = "default_base_position_pct")]
    pub base_position_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Fixed stop-loss fallback and clamp ceiling (fraction of entry)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Take-profit for a Standard-tier entry (higher tiers scale up)
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Minimum SL distance after ATR adjustment
    #[serde(default = "default_min_sl_pct")]
    pub min_sl_pct: Decimal,
    /// Maximum SL distance after ATR adjustment
    #[serde(default = "default_max_sl_pct")]
    pub max_sl_pct: Decimal,
    /// Net profit (after fees) a take-profit must clear, in quote currency
    #[serde(default = "default_min_profit_buffer")]
    pub min_profit_buffer: Decimal,
    /// Unrealized gain that activates the trailing stop
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: Decimal,
    /// Daily realized loss that trips the circuit breaker (positive number)
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    /// Consecutive losing closes that trip the circuit breaker
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    /// Maker fee rate
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    /// Taker fee rate
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    /// Slippage allowance folded into friction estimates
    #[serde(default = "default_slippage")]
    pub estimated_slippage: Decimal,
}

impl FeeConfig {
    /// Round-trip cost estimate as a fraction of notional.
    pub fn total_friction(&self) -> Decimal {
        self.maker_fee + self.taker_fee + self.estimated_slippage
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Nominal seconds between cycles
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    /// Fastest cadence (strong-bull markets)
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Slowest cadence (flat / strong-bear markets)
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Bounded worker pool size for exchange fan-out
    #[serde(default = "default_scan_workers")]
    pub workers: usize,
    /// Opportunities surfaced per cycle
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Signals older than this are discarded
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,
    /// Candles fetched per timeframe for analysis
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
    /// Symbols sampled (top by volume) for regime detection
    #[serde(default = "default_regime_sample")]
    pub regime_sample: usize,
    /// Hard budget per phase in seconds
    #[serde(default = "default_phase_budget_secs")]
    pub phase_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Minimum 24h quote volume for a symbol to be eligible
    #[serde(default = "default_min_volume_24h")]
    pub min_volume_24h: Decimal,
    /// Maximum bid/ask spread tolerated at entry
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    /// Base assets never traded (stablecoins)
    #[serde(default = "default_stablecoins")]
    pub stablecoins: HashSet<String>,
    /// Operator-supplied ignore list
    #[serde(default)]
    pub ignored_symbols: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Pending buys older than this are canceled
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    /// REST call timeout
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Positions older than this with negligible gain are closed
    #[serde(default = "default_decay_timeout_secs")]
    pub decay_timeout_secs: u64,
    /// Gain below which a stale position counts as decayed
    #[serde(default = "default_decay_max_gain_pct")]
    pub decay_max_gain_pct: Decimal,
    /// Minimum unrealized gain before a position may be recycled
    #[serde(default = "default_recycle_min_gain_pct")]
    pub recycle_min_gain_pct: Decimal,
    /// Opportunity-score drop that marks a position recyclable
    #[serde(default = "default_recycle_quality_drop")]
    pub recycle_quality_drop: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between periodic reconciliation passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Holdings below this value (quote currency) are treated as dust
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory all durable files live under
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl PathsConfig {
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("agent_state.json")
    }

    pub fn learning_file(&self) -> PathBuf {
        self.data_dir.join("learning_memory.json")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join("trade_ledger.jsonl")
    }

    pub fn trade_db(&self) -> PathBuf {
        self.data_dir.join("trades.db")
    }

    pub fn universe_cache(&self) -> PathBuf {
        self.data_dir.join("symbol_rules.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("agent.lock")
    }
}

// Default value functions

fn default_paper_trading() -> bool {
    true
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_min_capital_per_trade() -> Decimal {
    Decimal::new(11, 0) // $11
}

fn default_max_capital_per_trade() -> Decimal {
    Decimal::new(30, 0) // $30
}

fn default_max_total_positions() -> usize {
    25
}

fn default_base_position_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_take_profit_pct() -> Decimal {
    Decimal::new(15, 3) // 0.015
}

fn default_min_sl_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_sl_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_min_profit_buffer() -> Decimal {
    Decimal::new(5, 2) // $0.05
}

fn default_trailing_activation_pct() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(5, 0) // $5
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_maker_fee() -> Decimal {
    Decimal::new(10, 4) // 0.10%
}

fn default_taker_fee() -> Decimal {
    Decimal::new(10, 4) // 0.10%
}

fn default_slippage() -> Decimal {
    Decimal::new(5, 4) // 0.05%
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_min_interval_secs() -> u64 {
    3
}

fn default_max_interval_secs() -> u64 {
    30
}

fn default_scan_workers() -> usize {
    8
}

fn default_top_k() -> usize {
    25
}

fn default_signal_ttl_secs() -> u64 {
    60
}

fn default_candle_limit() -> usize {
    50
}

fn default_regime_sample() -> usize {
    40
}

fn default_phase_budget_secs() -> u64 {
    60
}

fn default_min_volume_24h() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_max_spread() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_stablecoins() -> HashSet<String> {
    ["USDT", "USDC", "DAI", "BUSD", "TUSD", "PAX", "USDD"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_pending_ttl_secs() -> u64 {
    120
}

fn default_order_timeout_secs() -> u64 {
    10
}

fn default_decay_timeout_secs() -> u64 {
    7200
}

fn default_decay_max_gain_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_recycle_min_gain_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_recycle_quality_drop() -> f64 {
    15.0
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_dust_threshold() -> Decimal {
    Decimal::ONE // $1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("SPOT_AGENT"),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut cfg: Config = raw
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.apply_legacy_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply flat environment overrides kept for operational compatibility.
    fn apply_legacy_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PAPER_TRADING") {
            self.trading.paper_trading = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Ok(v) = std::env::var("MIN_CAPITAL_PER_TRADE") {
            self.trading.min_capital_per_trade =
                Decimal::from_str(&v).context("MIN_CAPITAL_PER_TRADE is not a number")?;
        }
        if let Ok(v) = std::env::var("MAX_CAPITAL_PER_TRADE") {
            self.trading.max_capital_per_trade =
                Decimal::from_str(&v).context("MAX_CAPITAL_PER_TRADE is not a number")?;
        }
        if let Ok(v) = std::env::var("MAX_TOTAL_POSITIONS") {
            self.trading.max_total_positions =
                v.parse().context("MAX_TOTAL_POSITIONS is not an integer")?;
        }
        if let Ok(v) = std::env::var("STOP_LOSS_PCT") {
            self.risk.stop_loss_pct =
                Decimal::from_str(&v).context("STOP_LOSS_PCT is not a number")?;
        }
        if let Ok(v) = std::env::var("TAKE_PROFIT_PCT") {
            self.risk.take_profit_pct =
                Decimal::from_str(&v).context("TAKE_PROFIT_PCT is not a number")?;
        }
        if let Ok(v) = std::env::var("SCAN_INTERVAL_SECONDS") {
            self.scan.interval_secs =
                v.parse().context("SCAN_INTERVAL_SECONDS is not an integer")?;
        }
        if let Ok(v) = std::env::var("DAILY_LOSS_LIMIT") {
            self.risk.daily_loss_limit =
                Decimal::from_str(&v).context("DAILY_LOSS_LIMIT is not a number")?;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.min_capital_per_trade > Decimal::ZERO,
            "min_capital_per_trade must be positive"
        );

        anyhow::ensure!(
            self.trading.max_capital_per_trade >= self.trading.min_capital_per_trade,
            "max_capital_per_trade must be >= min_capital_per_trade"
        );

        anyhow::ensure!(
            self.trading.base_position_pct > Decimal::ZERO
                && self.trading.base_position_pct <= Decimal::ONE,
            "base_position_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.min_sl_pct > Decimal::ZERO && self.risk.min_sl_pct <= self.risk.max_sl_pct,
            "min_sl_pct must be positive and <= max_sl_pct"
        );

        anyhow::ensure!(
            self.risk.stop_loss_pct > Decimal::ZERO && self.risk.take_profit_pct > Decimal::ZERO,
            "stop_loss_pct and take_profit_pct must be positive"
        );

        anyhow::ensure!(
            self.risk.daily_loss_limit > Decimal::ZERO,
            "daily_loss_limit must be positive"
        );

        anyhow::ensure!(
            self.scan.min_interval_secs <= self.scan.interval_secs
                && self.scan.interval_secs <= self.scan.max_interval_secs,
            "scan intervals must satisfy min <= nominal <= max"
        );

        anyhow::ensure!(self.scan.workers > 0, "scan workers must be > 0");
        anyhow::ensure!(
            self.trading.max_total_positions > 0,
            "max_total_positions must be > 0"
        );

        Ok(())
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            paper_trading: default_paper_trading(),
            quote_currency: default_quote_currency(),
            min_capital_per_trade: default_min_capital_per_trade(),
            max_capital_per_trade: default_max_capital_per_trade(),
            max_total_positions: default_max_total_positions(),
            base_position_pct: default_base_position_pct(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            min_sl_pct: default_min_sl_pct(),
            max_sl_pct: default_max_sl_pct(),
            min_profit_buffer: default_min_profit_buffer(),
            trailing_activation_pct: default_trailing_activation_pct(),
            daily_loss_limit: default_daily_loss_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_fee: default_maker_fee(),
            taker_fee: default_taker_fee(),
            estimated_slippage: default_slippage(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            workers: default_scan_workers(),
            top_k: default_top_k(),
            signal_ttl_secs: default_signal_ttl_secs(),
            candle_limit: default_candle_limit(),
            regime_sample: default_regime_sample(),
            phase_budget_secs: default_phase_budget_secs(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_volume_24h: default_min_volume_24h(),
            max_spread: default_max_spread(),
            stablecoins: default_stablecoins(),
            ignored_symbols: HashSet::new(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl_secs(),
            order_timeout_secs: default_order_timeout_secs(),
            decay_timeout_secs: default_decay_timeout_secs(),
            decay_max_gain_pct: default_decay_max_gain_pct(),
            recycle_min_gain_pct: default_recycle_min_gain_pct(),
            recycle_quality_drop: default_recycle_quality_drop(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            dust_threshold: default_dust_threshold(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kucoin: KucoinConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            fees: FeeConfig::default(),
            scan: ScanConfig::default(),
            filter: FilterConfig::default(),
            execution: ExecutionConfig::default(),
            reconcile: ReconcileConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_total_friction() {
        let fees = FeeConfig::default();
        // 0.10% + 0.10% + 0.05%
        assert_eq!(fees.total_friction(), dec!(0.0025));
    }

    #[test]
    fn test_invalid_interval_ordering_rejected() {
        let mut config = Config::default();
        config.scan.min_interval_secs = 60;
        assert!(config.validate().is_err());
    }
}
