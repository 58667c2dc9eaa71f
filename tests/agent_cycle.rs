//! End-to-end agent scenarios against the mock exchange.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use spot_agent::agent::Agent;
use spot_agent::config::Config;
use spot_agent::exchange::{
    Candle, MockExchange, OrderSide, SpotExchange, Ticker, Timeframe,
};
use spot_agent::ledger::{CloseReason, FillSource, TradeLedger, TradeRecord};
use spot_agent::learning::LearningMemory;
use spot_agent::reconcile::{ReconcileStatus, Reconciler};
use spot_agent::regime::Regime;
use spot_agent::signals::onchain::{OnchainMonitor, WhaleActivity};
use spot_agent::signals::sentiment::SentimentAggregator;
use spot_agent::signals::SignalSource;
use spot_agent::state::{AgentMode, Position, StateStore};

/// Config rooted in a temp dir with live-path execution against the mock.
fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.trading.paper_trading = false;
    config.scan.interval_secs = 10;
    config
}

fn uptrend_candles(symbol: &str, timeframe: Timeframe, base: f64, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = Decimal::from_f64(base * (1.0 + 0.002 * i as f64)).unwrap();
            Candle {
                symbol: symbol.to_string(),
                timeframe,
                open_time: Utc::now(),
                open: close,
                high: close * dec!(1.004),
                low: close * dec!(0.996),
                close,
                volume: Decimal::from_f64(1000.0 + 10.0 * i as f64).unwrap(),
            }
        })
        .collect()
}

/// Seed a liquid, strongly trending market for one tradable symbol plus
/// filler tickers so the regime detector has a sample.
async fn seed_market(exchange: &MockExchange, symbol: &str, price: Decimal) {
    exchange.add_symbol(symbol, dec!(0.001), dec!(0.1), dec!(1)).await;
    exchange.set_price(symbol, price).await;
    for timeframe in Timeframe::all() {
        let base = price.to_string().parse::<f64>().unwrap() * 0.9;
        exchange
            .set_candles(symbol, timeframe, uptrend_candles(symbol, timeframe, base, 60))
            .await;
    }
    // Filler sample for regime classification (not tradable: no rules)
    for i in 0..12 {
        exchange
            .set_ticker(Ticker {
                symbol: format!("FILL{i}-USDT"),
                price: dec!(1),
                best_bid: dec!(0.999),
                best_ask: dec!(1.001),
                volume_24h: dec!(10_000),
                change_24h: dec!(0.005),
            })
            .await;
    }
}

async fn build_agent(
    config: Config,
    exchange: Arc<MockExchange>,
    onchain: Arc<OnchainMonitor>,
) -> Agent {
    let intelligence: Vec<Arc<dyn SignalSource>> = vec![onchain];
    Agent::new(
        config,
        exchange as Arc<dyn SpotExchange>,
        SentimentAggregator::disabled(),
        intelligence,
    )
    .unwrap()
}

#[tokio::test]
async fn test_happy_path_take_profit() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;

    let mut agent = build_agent(test_config(&dir), Arc::clone(&exchange), onchain).await;

    // Cycle 1: scan, score, place the entry (auto-filled on the venue)
    agent.run_cycle().await.unwrap();
    let snapshot = agent.state_snapshot();
    assert_eq!(
        snapshot.pending_buys.len() + snapshot.positions.len(),
        1,
        "entry should be in flight or filled"
    );

    // Cycle 2: promotion to a live position
    agent.run_cycle().await.unwrap();
    let snapshot = agent.state_snapshot();
    assert_eq!(snapshot.positions.len(), 1);
    let position = snapshot.positions.values().next().unwrap().clone();
    assert!(position.take_profit > position.entry_price);
    assert!(position.stop_loss < position.entry_price);
    assert_eq!(snapshot.daily.trades, 1);

    // Price reaches the target: the monitor fires a maker close
    exchange.set_price("ABC-USDT", position.take_profit).await;
    agent.run_cycle().await.unwrap();

    let snapshot = agent.state_snapshot();
    assert!(snapshot.positions.is_empty(), "position should be closed");
    assert_eq!(snapshot.daily.wins, 1);
    assert!(snapshot.daily.realized_pnl > Decimal::ZERO);
    assert_eq!(snapshot.consecutive_losses, 0);

    // Both fills are on the ledger, exit carries reason + realized PnL
    let ledger = TradeLedger::open(dir.path().join("trade_ledger.jsonl")).unwrap();
    let records = ledger.load_all().unwrap();
    let sells: Vec<&TradeRecord> = records.iter().filter(|r| r.side == OrderSide::Sell).collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].reason, Some(CloseReason::TakeProfit));
    assert!(sells[0].realized_pnl.unwrap() > Decimal::ZERO);
}

#[tokio::test]
async fn test_stop_loss_on_price_gap() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;

    let mut agent = build_agent(test_config(&dir), Arc::clone(&exchange), onchain).await;

    agent.run_cycle().await.unwrap(); // entry
    agent.run_cycle().await.unwrap(); // promotion
    assert_eq!(agent.state_snapshot().positions.len(), 1);

    // Gap far through the stop between cycles
    exchange.set_price("ABC-USDT", dec!(9.0)).await;
    agent.run_cycle().await.unwrap();

    let snapshot = agent.state_snapshot();
    assert!(snapshot.positions.is_empty());
    assert_eq!(snapshot.daily.losses, 1);
    assert_eq!(snapshot.consecutive_losses, 1);
    assert!(snapshot.daily.realized_pnl < Decimal::ZERO);

    let ledger = TradeLedger::open(dir.path().join("trade_ledger.jsonl")).unwrap();
    let sells: Vec<TradeRecord> = ledger
        .load_all()
        .unwrap()
        .into_iter()
        .filter(|r| r.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells[0].reason, Some(CloseReason::StopLoss));
}

#[tokio::test]
async fn test_circuit_breaker_blocks_entries_but_honors_exits() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;

    // One losing close is enough to trip the breaker
    let mut config = test_config(&dir);
    config.risk.max_consecutive_losses = 1;

    let mut agent = build_agent(config, Arc::clone(&exchange), onchain).await;

    agent.run_cycle().await.unwrap(); // entry
    agent.run_cycle().await.unwrap(); // promotion
    exchange.set_price("ABC-USDT", dec!(9.0)).await;
    agent.run_cycle().await.unwrap(); // stop-loss close -> breaker arms

    // Market recovers; a fresh opportunity exists but no entries happen
    exchange.set_price("ABC-USDT", dec!(10)).await;
    agent.run_cycle().await.unwrap();

    let snapshot = agent.state_snapshot();
    assert_eq!(snapshot.agent_mode, AgentMode::Observing);
    assert!(snapshot.positions.is_empty());
    assert!(snapshot.pending_buys.is_empty());
}

#[tokio::test]
async fn test_no_symbol_holds_position_and_pending_simultaneously() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(200), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;

    let mut agent = build_agent(test_config(&dir), Arc::clone(&exchange), onchain).await;

    for _ in 0..4 {
        agent.run_cycle().await.unwrap();
        assert!(agent.state_snapshot().invariant_violations().is_empty());
    }
}

#[tokio::test]
async fn test_crash_between_ledger_append_and_state_removal_converges() {
    // Simulates the crash window: the exit hit the ledger, but the process
    // died before the position left the state store. The venue shows no
    // base balance; reconciliation must finish the cleanup.
    let dir = tempfile::tempdir().unwrap();
    let exchange = MockExchange::new();
    exchange.add_symbol("ABC-USDT", dec!(0.001), dec!(0.1), dec!(1)).await;
    exchange.set_price("ABC-USDT", dec!(10.15)).await;
    exchange.set_balance("USDT", dec!(118), Decimal::ZERO).await;

    let mut state = StateStore::load(dir.path().join("state.json")).unwrap();
    state
        .mutate(|s| {
            s.positions.insert(
                "ABC-USDT".to_string(),
                Position {
                    symbol: "ABC-USDT".to_string(),
                    quantity: dec!(1.8),
                    entry_price: dec!(10),
                    entry_fee: dec!(0.018),
                    current_price: dec!(10),
                    take_profit: dec!(10.15),
                    stop_loss: dec!(9.5),
                    high_water_gain_pct: Decimal::ZERO,
                    opened_at: Utc::now(),
                    regime_at_entry: Regime::Normal,
                    strategy: "swing".to_string(),
                    opportunity_score: 80.0,
                    entry_order_id: None,
                },
            );
        })
        .unwrap();

    let mut ledger = TradeLedger::open(dir.path().join("ledger.jsonl")).unwrap();
    ledger
        .append(&TradeRecord {
            id: "entry-1".to_string(),
            symbol: "ABC-USDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(1.8),
            price: dec!(10),
            fees: dec!(0.018),
            timestamp: Utc::now(),
            reason: None,
            realized_pnl: None,
            fill_source: FillSource::ActiveTrade,
        })
        .unwrap();
    ledger
        .append(&TradeRecord {
            id: "exit-1".to_string(),
            symbol: "ABC-USDT".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(1.8),
            price: dec!(10.15),
            fees: dec!(0.018),
            timestamp: Utc::now(),
            reason: Some(CloseReason::TakeProfit),
            realized_pnl: Some(dec!(0.234)),
            fill_source: FillSource::ActiveTrade,
        })
        .unwrap();

    let reconciler = Reconciler::new(
        Default::default(),
        Default::default(),
        Default::default(),
        spot_agent::config::FilterConfig::default().stablecoins,
    );
    let report = reconciler.run(&exchange, &mut state, &ledger).await.unwrap();

    assert_eq!(report.status, ReconcileStatus::Warn);
    let snapshot = state.snapshot();
    assert!(snapshot.positions.is_empty(), "ledger-closed ghost removed");
    // Capital converges to the authoritative balance
    assert_eq!(snapshot.capital.available, dec!(118));
    assert_eq!(snapshot.capital.total_assets, dec!(118));

    // Folding the ledger twice cannot double-count the learning outcome
    let mut learning = LearningMemory::in_memory();
    for record in ledger.load_all().unwrap() {
        if let (Some(reason), Some(pnl)) = (record.reason, record.realized_pnl) {
            learning.record_close(&record.id, Regime::Normal, reason, &record.symbol, pnl);
            learning.record_close(&record.id, Regime::Normal, reason, &record.symbol, pnl);
        }
    }
    assert_eq!(learning.regime_stats(Regime::Normal).trades, 1);
}

#[tokio::test]
async fn test_reconcile_of_consistent_system_is_warn_free() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = MockExchange::new();
    exchange.add_symbol("ABC-USDT", dec!(0.001), dec!(0.1), dec!(1)).await;
    exchange.set_price("ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let mut state = StateStore::load(dir.path().join("state.json")).unwrap();
    let ledger = TradeLedger::open(dir.path().join("ledger.jsonl")).unwrap();
    let reconciler = Reconciler::new(
        Default::default(),
        Default::default(),
        Default::default(),
        spot_agent::config::FilterConfig::default().stablecoins,
    );

    let first = reconciler.run(&exchange, &mut state, &ledger).await.unwrap();
    assert_eq!(first.status, ReconcileStatus::Ok);
    // Idempotence: a second pass over the converged system changes nothing
    let second = reconciler.run(&exchange, &mut state, &ledger).await.unwrap();
    assert_eq!(second.status, ReconcileStatus::Ok);
}

#[tokio::test]
async fn test_state_file_round_trip_equality() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut store = StateStore::load(path.clone()).unwrap();
    store
        .mutate(|s| {
            s.daily.trades = 7;
            s.daily.realized_pnl = dec!(1.25);
            s.last_regime = Regime::Bull;
            s.positions.insert(
                "ABC-USDT".to_string(),
                Position {
                    symbol: "ABC-USDT".to_string(),
                    quantity: dec!(2),
                    entry_price: dec!(5),
                    entry_fee: dec!(0.01),
                    current_price: dec!(5.1),
                    take_profit: dec!(5.2),
                    stop_loss: dec!(4.8),
                    high_water_gain_pct: dec!(0.02),
                    opened_at: Utc::now(),
                    regime_at_entry: Regime::Bull,
                    strategy: "swing".to_string(),
                    opportunity_score: 88.0,
                    entry_order_id: Some("o-1".to_string()),
                },
            );
        })
        .unwrap();
    let original = store.snapshot();
    drop(store);

    let reloaded = StateStore::load(path).unwrap();
    let restored = reloaded.snapshot();

    assert_eq!(restored.version, original.version);
    assert_eq!(restored.daily.trades, original.daily.trades);
    assert_eq!(restored.last_regime, original.last_regime);
    let a = &original.positions["ABC-USDT"];
    let b = &restored.positions["ABC-USDT"];
    assert_eq!(a.quantity, b.quantity);
    assert_eq!(a.take_profit, b.take_profit);
    assert_eq!(a.high_water_gain_pct, b.high_water_gain_pct);
    assert_eq!(a.entry_order_id, b.entry_order_id);
}

#[tokio::test]
async fn test_paper_mode_smoke() {
    // Paper agent: entries settle locally, nothing rests on the venue.
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;

    let mut config = test_config(&dir);
    config.trading.paper_trading = true;

    let mut agent = build_agent(config, Arc::clone(&exchange), onchain).await;
    agent.run_cycle().await.unwrap();

    let snapshot = agent.state_snapshot();
    assert_eq!(snapshot.positions.len(), 1, "paper entry fills immediately");
    assert!(exchange.get_open_orders().await.unwrap().is_empty());
    assert!(exchange.fills().await.is_empty(), "venue never saw an order");

    // Price to target: paper close realizes the win locally
    let tp = snapshot.positions.values().next().unwrap().take_profit;
    exchange.set_price("ABC-USDT", tp).await;
    agent.run_cycle().await.unwrap();
    let snapshot = agent.state_snapshot();
    assert!(snapshot.positions.is_empty());
    assert_eq!(snapshot.daily.wins, 1);
}

#[tokio::test]
async fn test_capital_identity_holds_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let exchange = Arc::new(MockExchange::new());
    seed_market(&exchange, "ABC-USDT", dec!(10)).await;
    exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;

    let onchain = Arc::new(OnchainMonitor::new());
    onchain.report("ABC-USDT", WhaleActivity::Accumulation).await;

    let mut agent = build_agent(test_config(&dir), Arc::clone(&exchange), onchain).await;

    for _ in 0..3 {
        agent.run_cycle().await.unwrap();
        let snapshot = agent.state_snapshot();
        let c = &snapshot.capital;
        assert_eq!(c.total_assets, c.available + c.locked + c.holdings);
    }
}

#[tokio::test]
async fn test_scores_are_deterministic_for_same_market() {
    // Two agents over identical markets surface the same opportunity set.
    async fn mk(dir: &tempfile::TempDir) -> Agent {
        let exchange = Arc::new(MockExchange::new());
        seed_market(&exchange, "ABC-USDT", dec!(10)).await;
        exchange.set_balance("USDT", dec!(100), Decimal::ZERO).await;
        let onchain = Arc::new(OnchainMonitor::new());
        onchain.report("ABC-USDT", WhaleActivity::HeavyAccumulation).await;
        build_agent(test_config(dir), exchange, onchain).await
    }

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut agent_a = mk(&dir_a).await;
    let mut agent_b = mk(&dir_b).await;

    agent_a.run_cycle().await.unwrap();
    agent_b.run_cycle().await.unwrap();

    let a = agent_a.state_snapshot();
    let b = agent_b.state_snapshot();
    let keys = |m: &HashMap<String, spot_agent::state::PendingBuy>| {
        let mut k: Vec<&String> = m.keys().collect();
        k.sort();
        k.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    };
    assert_eq!(keys(&a.pending_buys), keys(&b.pending_buys));
}
