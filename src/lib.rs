//! # Spot Agent
//!
//! An autonomous spot-market trading agent for KuCoin.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: KuCoin REST client and the mock venue for paper runs
//! - `universe`: Tradable symbol set and exchange-rule cache
//! - `signals`: Technical, sentiment, on-chain and cross-exchange fetchers
//! - `regime`: Market regime detection with transition hysteresis
//! - `scoring`: Regime-adaptive composite scoring and tier assignment
//! - `risk`: Position sizing, protective levels, trailing stops
//! - `execution`: Order placement and position lifecycle
//! - `monitor`: Per-cycle exit evaluation for open positions
//! - `state`: Durable agent state with atomic snapshots
//! - `ledger`: Append-only trade log plus SQLite mirror
//! - `reconcile`: State/ledger/exchange convergence
//! - `learning`: Outcome memory feeding adaptive scoring
//! - `agent`: The cooperative cycle scheduler tying it all together

pub mod agent;
pub mod config;
pub mod exchange;
pub mod execution;
pub mod learning;
pub mod ledger;
pub mod monitor;
pub mod reconcile;
pub mod regime;
pub mod risk;
pub mod scoring;
pub mod signals;
pub mod state;
pub mod universe;
pub mod utils;

pub use config::Config;
