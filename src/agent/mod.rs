//! The autonomous agent loop.
//!
//! A single-threaded cooperative scheduler drives every cycle through a
//! fixed phase order: housekeeping, awareness, learning, detection, scan,
//! score, decide, execute, monitor, persist, sleep. Phases never observe
//! each other's mutations mid-flight; exchange IO fans out through a
//! bounded worker pool and joins before the next phase starts.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::{SpotExchange, Ticker, Timeframe};
use crate::execution::{ExecutionEngine, ExecutionError};
use crate::learning::LearningMemory;
use crate::ledger::{CloseReason, TradeLedger, TradeRecord, TradeStore};
use crate::monitor::PositionMonitor;
use crate::reconcile::{ReconcileStatus, Reconciler};
use crate::regime::{Regime, RegimeDetector};
use crate::risk::{RiskSizer, SizingRejection};
use crate::scoring::{Opportunity, SymbolAnalysis, UnifiedScorer};
use crate::signals::sentiment::SentimentAggregator;
use crate::signals::{multi_timeframe, technical, volume_score, MarketView, SignalSource};
use crate::state::{AgentMode, CapitalAwareness, DailyCounters, StateStore};
use crate::universe::SymbolUniverse;
use crate::utils::fs::ProcessLock;

/// Symbols scanned per cycle beyond the ones already held.
const SCAN_CANDIDATES: usize = 30;
/// Strong-setup floor used by the capital recycling fast path.
const RECYCLE_SCORE_FLOOR: f64 = 85.0;
/// Score gap to the average held position that justifies recycling.
const RECYCLE_SCORE_VARIANCE: f64 = 5.0;
/// Symbol rule refresh cadence.
const RULE_REFRESH_SECS: u64 = 1800;

/// Externally visible degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degradation {
    Ok,
    Degraded,
    Critical,
}

/// Snapshot of the agent's runtime status for external probes.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub mode: AgentMode,
    pub regime: Regime,
    pub cycle: u64,
    pub degradation: Degradation,
}

/// Why the agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Interrupted,
    Terminated,
    FatalReconciliation,
}

impl StopCause {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopCause::Interrupted => 130,
            StopCause::Terminated => 0,
            StopCause::FatalReconciliation => 2,
        }
    }
}

/// The agent: owns every subsystem and drives the cycle.
pub struct Agent {
    config: Config,
    exchange: Arc<dyn SpotExchange>,
    universe: SymbolUniverse,
    detector: RegimeDetector,
    scorer: UnifiedScorer,
    sizer: RiskSizer,
    engine: ExecutionEngine,
    monitor: PositionMonitor,
    reconciler: Reconciler,
    state: StateStore,
    ledger: TradeLedger,
    store: Option<TradeStore>,
    learning: LearningMemory,
    sentiment: SentimentAggregator,
    intelligence: Vec<Arc<dyn SignalSource>>,
    _lock: ProcessLock,

    cycle: u64,
    consecutive_critical: u32,
    last_reconcile: Option<Instant>,
    last_rule_refresh: Option<Instant>,
    latest_tickers: HashMap<String, Ticker>,
    latest_scores: HashMap<String, f64>,
    /// Closes awaiting the next LearningPhase fold
    pending_learning: Vec<(TradeRecord, Regime)>,
    /// A failed exit or balance surprise requested an early reconcile
    reconcile_requested: bool,
    /// Per-symbol rate-limit backoff
    backoff: HashMap<String, (u32, Instant)>,
}

impl Agent {
    /// Wire up all subsystems from configuration.
    pub fn new(
        config: Config,
        exchange: Arc<dyn SpotExchange>,
        sentiment: SentimentAggregator,
        intelligence: Vec<Arc<dyn SignalSource>>,
    ) -> Result<Self> {
        let lock = ProcessLock::acquire(&config.paths.lock_file())?;

        let universe = SymbolUniverse::new(
            config.filter.clone(),
            config.trading.quote_currency.clone(),
            config.paths.universe_cache(),
        );
        let state = StateStore::load(config.paths.state_file())?;
        let ledger = TradeLedger::open(config.paths.ledger_file())?;
        let learning = LearningMemory::load(config.paths.learning_file());
        let store = match TradeStore::open(config.paths.trade_db()) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "Trade store unavailable, continuing without mirror");
                None
            }
        };

        let detector = RegimeDetector::new(config.scan.regime_sample);
        let scorer = UnifiedScorer::new(config.scan.top_k);
        let sizer = RiskSizer::new(
            config.trading.clone(),
            config.risk.clone(),
            config.fees.clone(),
        );
        let engine = ExecutionEngine::new(
            config.trading.paper_trading,
            config.fees.clone(),
            config.execution.pending_ttl_secs,
        );
        let monitor = PositionMonitor::new(
            config.execution.clone(),
            config.risk.clone(),
            config.fees.clone(),
        );
        let reconciler = Reconciler::new(
            config.reconcile.clone(),
            config.trading.clone(),
            config.risk.clone(),
            config.filter.stablecoins.clone(),
        );

        Ok(Self {
            config,
            exchange,
            universe,
            detector,
            scorer,
            sizer,
            engine,
            monitor,
            reconciler,
            state,
            ledger,
            store,
            learning,
            sentiment,
            intelligence,
            _lock: lock,
            cycle: 0,
            consecutive_critical: 0,
            last_reconcile: None,
            last_rule_refresh: None,
            latest_tickers: HashMap::new(),
            latest_scores: HashMap::new(),
            pending_learning: Vec::new(),
            reconcile_requested: false,
            backoff: HashMap::new(),
        })
    }

    /// Immutable view of the current durable state (external probes).
    pub fn state_snapshot(&self) -> Arc<crate::state::AgentState> {
        self.state.snapshot()
    }

    /// Current runtime status for external probes.
    pub fn status(&self) -> AgentStatus {
        let snapshot = self.state.snapshot();
        let degradation = if snapshot.last_reconcile_critical {
            Degradation::Critical
        } else if self.universe.is_degraded() || snapshot.agent_mode == AgentMode::Degraded {
            Degradation::Degraded
        } else {
            Degradation::Ok
        };
        AgentStatus {
            mode: snapshot.agent_mode,
            regime: self.detector.current().regime,
            cycle: self.cycle,
            degradation,
        }
    }

    /// Run until a signal or a fatal condition stops the loop.
    /// Returns the stop cause; the binary maps it to an exit code.
    pub async fn run(&mut self) -> Result<StopCause> {
        self.startup().await?;

        let mut sigterm = signal_stream()?;

        loop {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Cycle failed; continuing");
            }

            if self.consecutive_critical >= 2 {
                error!("Two consecutive CRITICAL reconcile reports; exiting for supervisor restart");
                self.persist_phase();
                return Ok(StopCause::FatalReconciliation);
            }

            // Sleep phase: signals are honored at this boundary
            let interval = self.cycle_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT received; completing persist before exit");
                    self.persist_phase();
                    return Ok(StopCause::Interrupted);
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received; completing persist before exit");
                    self.persist_phase();
                    return Ok(StopCause::Terminated);
                }
            }
        }
    }

    async fn startup(&mut self) -> Result<()> {
        info!(
            paper = self.engine.is_paper(),
            quote = %self.config.trading.quote_currency,
            stop_loss_pct = %self.config.risk.stop_loss_pct,
            take_profit_pct = %self.config.risk.take_profit_pct,
            "Agent starting"
        );

        if let Err(e) = self.universe.refresh(self.exchange.as_ref()).await {
            warn!(error = %e, "Initial symbol refresh failed; relying on cache");
        }
        self.last_rule_refresh = Some(Instant::now());

        // Replay realized closes into learning memory; dedupe by trade id
        // makes this safe after any crash
        let records = self.ledger.load_all()?;
        let mut replayed = 0usize;
        for record in &records {
            if let (Some(reason), Some(pnl)) = (record.reason, record.realized_pnl) {
                if self.learning.record_close(
                    &record.id,
                    self.state.snapshot().last_regime,
                    reason,
                    &record.symbol,
                    pnl,
                ) {
                    replayed += 1;
                }
            }
        }
        if replayed > 0 {
            info!(replayed, "Ledger closes replayed into learning memory");
        }

        // Startup reconciliation converges state with the venue
        if !self.engine.is_paper() {
            let report = self
                .reconciler
                .run(self.exchange.as_ref(), &mut self.state, &self.ledger)
                .await?;
            self.note_reconcile(report.status);
        }
        Ok(())
    }

    /// One full cycle through all phases. PersistPhase always runs, even
    /// when an earlier phase failed, so durable state stays consistent.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.cycle += 1;
        debug!(cycle = self.cycle, "Cycle start");

        let result = self.cycle_phases().await;

        // 10. Persist
        self.persist_phase();
        self.learning.tick_cycle();
        result
    }

    async fn cycle_phases(&mut self) -> Result<()> {
        let budget = Duration::from_secs(self.config.scan.phase_budget_secs);

        // 1. Housekeeping
        self.housekeeping_phase(budget).await?;
        // 2. Awareness
        self.awareness_phase(budget).await?;
        // 3. Learning
        self.learning_phase();
        // 4. Detection
        let regime = self.detection_phase()?;
        // 5. Scan
        let analyses = self.scan_phase(budget).await;
        // 6. Score
        let opportunities = self.score_phase(&analyses, regime);
        // 7. Decide
        let admitted = self.decide_phase(&opportunities)?;
        // 8. Execute
        self.execute_phase(&admitted, regime).await?;
        // 9. Monitor
        self.monitor_phase().await
    }

    // ---------------------------------------------------------------- phases

    async fn housekeeping_phase(&mut self, budget: Duration) -> Result<()> {
        // Daily reset at the UTC boundary
        let today = Utc::now().date_naive();
        if self.state.snapshot().daily.date != today {
            let start_balance = self.state.snapshot().capital.total_assets;
            info!(%today, %start_balance, "New day, resetting daily counters");
            self.state.mutate(|s| {
                s.daily = DailyCounters::new(today, start_balance);
            })?;
        }

        // Periodic symbol rule refresh
        let refresh_due = self
            .last_rule_refresh
            .map(|t| t.elapsed() >= Duration::from_secs(RULE_REFRESH_SECS))
            .unwrap_or(true);
        if refresh_due || self.universe.is_empty() {
            let _ = self.universe.refresh(self.exchange.as_ref()).await;
            self.last_rule_refresh = Some(Instant::now());
        }

        // Periodic or requested reconciliation (live mode only; paper fills
        // never reach the venue, so there is nothing to converge against)
        let reconcile_due = self
            .last_reconcile
            .map(|t| t.elapsed() >= Duration::from_secs(self.config.reconcile.interval_secs))
            .unwrap_or(true);
        if !self.engine.is_paper() && (reconcile_due || self.reconcile_requested) {
            self.reconcile_requested = false;
            match timeout(
                budget,
                self.reconciler
                    .run(self.exchange.as_ref(), &mut self.state, &self.ledger),
            )
            .await
            {
                Ok(Ok(report)) => self.note_reconcile(report.status),
                Ok(Err(e)) => warn!(error = %e, "Reconcile pass failed"),
                Err(_) => warn!("Reconcile pass exceeded phase budget"),
            }
            self.last_reconcile = Some(Instant::now());
        }

        // Expire stale entry orders, promote filled ones
        if let Err(e) = self
            .engine
            .cancel_stale_pending(self.exchange.as_ref(), &mut self.state)
            .await
        {
            warn!(error = %e, "Stale pending cleanup failed");
        }
        if let Err(e) = self
            .engine
            .check_pending(
                self.exchange.as_ref(),
                &mut self.state,
                &mut self.ledger,
                self.store.as_ref(),
            )
            .await
        {
            warn!(error = %e, "Pending promotion failed");
        }
        Ok(())
    }

    async fn awareness_phase(&mut self, budget: Duration) -> Result<()> {
        let exchange = Arc::clone(&self.exchange);
        let fetched = timeout(budget, async {
            tokio::try_join!(exchange.get_balances(), exchange.get_all_tickers())
        })
        .await;

        match fetched {
            Ok(Ok((balances, tickers))) => {
                self.latest_tickers = tickers.into_iter().map(|t| (t.symbol.clone(), t)).collect();
                let quote_balance = balances
                    .get(&self.config.trading.quote_currency)
                    .cloned()
                    .unwrap_or_default();
                let paper = self.engine.is_paper();
                self.state.mutate(|s| {
                    // Refresh marks before capital valuation
                    for (symbol, position) in s.positions.iter_mut() {
                        if let Some(t) = self.latest_tickers.get(symbol) {
                            if t.price > Decimal::ZERO {
                                position.current_price = t.price;
                            }
                        }
                    }
                    if paper {
                        // Paper fills never reach the venue: free quote is
                        // tracked locally, seeded once from the real balance
                        if s.capital.updated_at.is_none() {
                            s.capital.available = quote_balance.free;
                        }
                        s.capital.refresh_totals(&s.positions, &s.pending_buys);
                    } else {
                        s.capital = CapitalAwareness::recompute(
                            &quote_balance,
                            &s.positions,
                            &s.pending_buys,
                        );
                    }
                })?;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Awareness fetch failed; serving stale data");
                self.state.mutate(|s| s.agent_mode = AgentMode::Degraded)?;
            }
            Err(_) => warn!("Awareness phase exceeded budget; partial results discarded"),
        }
        Ok(())
    }

    fn learning_phase(&mut self) {
        for (record, regime) in self.pending_learning.drain(..) {
            if let (Some(reason), Some(pnl)) = (record.reason, record.realized_pnl) {
                self.learning
                    .record_close(&record.id, regime, reason, &record.symbol, pnl);
            }
        }
    }

    fn detection_phase(&mut self) -> Result<Regime> {
        let tickers: Vec<Ticker> = self.latest_tickers.values().cloned().collect();
        let read = self.detector.update(&tickers);
        self.state.mutate(|s| s.last_regime = read.regime)?;
        Ok(read.regime)
    }

    /// Bounded-parallel fetch and analysis of candidate symbols.
    async fn scan_phase(&mut self, budget: Duration) -> Vec<SymbolAnalysis> {
        let snapshot = self.state.snapshot();

        // Candidates: the most liquid eligible symbols, plus everything we
        // hold (their scores feed the recycle/decay rules)
        let mut candidates: Vec<(String, Decimal)> = self
            .universe
            .all()
            .into_iter()
            .filter_map(|s| {
                let ticker = self.latest_tickers.get(&s)?;
                (ticker.volume_24h >= self.config.filter.min_volume_24h)
                    .then(|| (s, ticker.volume_24h))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(SCAN_CANDIDATES);

        let mut symbols: Vec<String> = candidates.into_iter().map(|(s, _)| s).collect();
        for held in snapshot.positions.keys() {
            if !symbols.contains(held) {
                symbols.push(held.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.scan.workers));
        let candle_limit = self.config.scan.candle_limit;
        let min_volume = self.config.filter.min_volume_24h;

        let mut join_set = tokio::task::JoinSet::new();
        for symbol in symbols {
            let Some(ticker) = self.latest_tickers.get(&symbol).cloned() else {
                continue;
            };
            let exchange = Arc::clone(&self.exchange);
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let mut candles = HashMap::new();
                for timeframe in Timeframe::all() {
                    match exchange.get_candles(&symbol, timeframe, candle_limit).await {
                        Ok(series) => {
                            candles.insert(timeframe, series);
                        }
                        Err(e) => {
                            debug!(%symbol, ?timeframe, error = %e, "Candle fetch failed");
                        }
                    }
                }
                Some((symbol, MarketView { ticker, candles }))
            });
        }

        // Join barrier with the phase budget; late results are discarded
        let mut views: Vec<(String, MarketView)> = Vec::new();
        let deadline = Instant::now() + budget;
        while let Ok(Some(joined)) = timeout_at_or_zero(deadline, join_set.join_next()).await {
            if let Ok(Some(view)) = joined {
                views.push(view);
            }
        }
        join_set.abort_all();

        let mut analyses = Vec::with_capacity(views.len());
        for (symbol, view) in views {
            let technical = technical::analyze(view.candles(Timeframe::M5));
            let mtf = multi_timeframe::alignment(&view);
            let sentiment = self.sentiment.score(&symbol, &view).await;

            // Intelligence: confidence-weighted blend of the external
            // sources (on-chain flow, cross-exchange lead)
            let mut weighted = 0.0;
            let mut weight = 0.0;
            let ttl = self.config.scan.signal_ttl_secs;
            let now = Utc::now();
            for source in &self.intelligence {
                let signal = source.score(&symbol, &view).await;
                if signal.confidence > 0.0 && signal.is_fresh(ttl, now) {
                    weighted += signal.score * signal.confidence;
                    weight += signal.confidence;
                }
            }
            let intelligence = if weight > 0.0 { weighted / weight } else { 50.0 };

            analyses.push(SymbolAnalysis {
                symbol,
                price: view.ticker.price,
                spread: view.ticker.spread(),
                volume_24h: view.ticker.volume_24h,
                technical,
                multi_timeframe: mtf.score,
                intelligence,
                sentiment: if sentiment.confidence > 0.0 {
                    sentiment.score
                } else {
                    50.0
                },
                volume_score: volume_score(view.ticker.volume_24h, min_volume),
            });
        }

        debug!(analyzed = analyses.len(), "Scan complete");
        analyses
    }

    fn score_phase(&mut self, analyses: &[SymbolAnalysis], regime: Regime) -> Vec<Opportunity> {
        let opportunities = self.scorer.rank(analyses, regime, &self.learning);

        // Remember composite scores for held symbols: the monitor's
        // quality-decay rule compares against them next phase
        self.latest_scores = analyses
            .iter()
            .map(|a| (a.symbol.clone(), crate::scoring::composite_score(a, regime)))
            .collect();

        if let Some(best) = opportunities.first() {
            info!(
                symbol = %best.symbol,
                composite = best.composite,
                tier = %best.tier,
                candidates = opportunities.len(),
                "Scoring complete"
            );
        }
        opportunities
    }

    /// Admission control: the circuit breaker and global capacity limits.
    fn decide_phase(&mut self, opportunities: &[Opportunity]) -> Result<Vec<Opportunity>> {
        let snapshot = self.state.snapshot();

        let loss_limit = self.config.risk.daily_loss_limit;
        let breaker_tripped = snapshot.daily.realized_pnl < -loss_limit
            || snapshot.consecutive_losses >= self.config.risk.max_consecutive_losses
            || snapshot.last_reconcile_critical;

        if breaker_tripped {
            if snapshot.agent_mode != AgentMode::Observing {
                warn!(
                    daily_pnl = %snapshot.daily.realized_pnl,
                    consecutive_losses = snapshot.consecutive_losses,
                    reconcile_critical = snapshot.last_reconcile_critical,
                    "Circuit breaker tripped; close-only mode"
                );
            }
            self.state.mutate(|s| s.agent_mode = AgentMode::Observing)?;
            return Ok(Vec::new());
        }

        let mode = if self.universe.is_degraded() {
            AgentMode::Degraded
        } else {
            AgentMode::Hunting
        };
        self.state.mutate(|s| s.agent_mode = mode)?;

        let open_slots = self
            .config
            .trading
            .max_total_positions
            .saturating_sub(snapshot.positions.len() + snapshot.pending_buys.len());
        if open_slots == 0 {
            debug!("At position capacity; no entries this cycle");
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let admitted: Vec<Opportunity> = opportunities
            .iter()
            .filter(|o| {
                if o.spread > self.config.filter.max_spread {
                    debug!(symbol = %o.symbol, spread = %o.spread, "Skipped: spread too wide");
                    return false;
                }
                if snapshot.positions.contains_key(&o.symbol)
                    || snapshot.pending_buys.contains_key(&o.symbol)
                {
                    return false;
                }
                if let Some((_, until)) = self.backoff.get(&o.symbol) {
                    if *until > now {
                        debug!(symbol = %o.symbol, "Skipped: rate-limit backoff");
                        return false;
                    }
                }
                true
            })
            .take(open_slots)
            .cloned()
            .collect();

        Ok(admitted)
    }

    async fn execute_phase(&mut self, admitted: &[Opportunity], regime: Regime) -> Result<()> {
        if admitted.is_empty() {
            return Ok(());
        }

        // Capital recycling: starved of cash with a strong candidate on
        // deck, free the weakest small-profit position first
        self.maybe_recycle_capital(admitted, regime).await?;

        for opportunity in admitted {
            let available = self.state.snapshot().capital.available;
            let rule = match self.universe.rules(&opportunity.symbol) {
                Ok(rule) => rule.clone(),
                Err(e) => {
                    debug!(symbol = %opportunity.symbol, error = %e, "Skipped: no rules");
                    continue;
                }
            };

            let plan = match self.sizer.plan_entry(opportunity, &rule, regime, available) {
                Ok(plan) => plan,
                Err(SizingRejection::InsufficientCapital) => break, // nothing left this cycle
                Err(rejection) => {
                    debug!(symbol = %opportunity.symbol, %rejection, "Entry rejected by sizing");
                    continue;
                }
            };

            match self
                .engine
                .open(
                    self.exchange.as_ref(),
                    &mut self.state,
                    &mut self.ledger,
                    self.store.as_ref(),
                    &plan,
                    opportunity.composite,
                    regime,
                )
                .await
            {
                Ok(_) => {
                    self.backoff.remove(&opportunity.symbol);
                }
                Err(ExecutionError::PriceIncrementInvalid(symbol)) => {
                    warn!(%symbol, "Rule drift detected; forcing rule refresh");
                    let _ = self.universe.refresh(self.exchange.as_ref()).await;
                    self.last_rule_refresh = Some(Instant::now());
                }
                Err(ExecutionError::RateLimited) => {
                    let attempts = self
                        .backoff
                        .get(&opportunity.symbol)
                        .map(|(a, _)| a + 1)
                        .unwrap_or(1);
                    let delay = Duration::from_secs(2u64.saturating_pow(attempts.min(6)));
                    self.backoff
                        .insert(opportunity.symbol.clone(), (attempts, Instant::now() + delay));
                    warn!(symbol = %opportunity.symbol, attempts, "Rate limited; backing off");
                }
                Err(ExecutionError::InsufficientBalance) => {
                    self.reconcile_requested = true;
                    break;
                }
                Err(ExecutionError::DuplicateInFlight(symbol)) => {
                    debug!(%symbol, "Duplicate entry suppressed");
                }
                Err(e) => warn!(symbol = %opportunity.symbol, error = %e, "Entry failed"),
            }
        }
        Ok(())
    }

    /// Close the best small-profit position to fund a strong newcomer.
    async fn maybe_recycle_capital(
        &mut self,
        admitted: &[Opportunity],
        _regime: Regime,
    ) -> Result<()> {
        let snapshot = self.state.snapshot();
        if snapshot.capital.available >= self.config.trading.min_capital_per_trade {
            return Ok(());
        }
        let Some(best) = admitted.first() else {
            return Ok(());
        };
        if best.composite < RECYCLE_SCORE_FLOOR || snapshot.positions.is_empty() {
            return Ok(());
        }

        let avg_score: f64 = snapshot
            .positions
            .values()
            .map(|p| p.opportunity_score)
            .sum::<f64>()
            / snapshot.positions.len() as f64;
        if best.composite - avg_score < RECYCLE_SCORE_VARIANCE {
            return Ok(());
        }

        // Weakest thesis with at least the minimum gain
        let candidate = snapshot
            .positions
            .values()
            .filter(|p| p.unrealized_gain_pct() >= self.config.execution.recycle_min_gain_pct)
            .min_by(|a, b| {
                a.opportunity_score
                    .partial_cmp(&b.opportunity_score)
                    .expect("scores are finite")
            })
            .map(|p| (p.symbol.clone(), p.regime_at_entry));

        if let Some((symbol, entry_regime)) = candidate {
            info!(
                %symbol,
                for_symbol = %best.symbol,
                best_score = best.composite,
                "Recycling capital into stronger setup"
            );
            match self
                .engine
                .close(
                    self.exchange.as_ref(),
                    &mut self.state,
                    &mut self.ledger,
                    self.store.as_ref(),
                    &symbol,
                    CloseReason::RecycleProfit,
                )
                .await
            {
                Ok(record) => self.pending_learning.push((record, entry_regime)),
                Err(ExecutionError::InsufficientBalance) => self.reconcile_requested = true,
                Err(e) => warn!(%symbol, error = %e, "Recycle close failed"),
            }
        }
        Ok(())
    }

    async fn monitor_phase(&mut self) -> Result<()> {
        let requests = self.monitor.evaluate(
            &mut self.state,
            &self.latest_tickers,
            &self.universe,
            &self.sizer,
            &self.latest_scores,
            Utc::now(),
        )?;

        for request in requests {
            let entry_regime = self
                .state
                .snapshot()
                .positions
                .get(&request.symbol)
                .map(|p| p.regime_at_entry)
                .unwrap_or(Regime::Unknown);

            match self
                .engine
                .close(
                    self.exchange.as_ref(),
                    &mut self.state,
                    &mut self.ledger,
                    self.store.as_ref(),
                    &request.symbol,
                    request.reason,
                )
                .await
            {
                Ok(record) => self.pending_learning.push((record, entry_regime)),
                Err(ExecutionError::InsufficientBalance) => {
                    // Held quantity diverged from our books; reconcile
                    // instead of hammering the venue
                    self.reconcile_requested = true;
                }
                Err(e) => {
                    warn!(symbol = %request.symbol, reason = %request.reason, error = %e, "Close failed")
                }
            }
        }
        Ok(())
    }

    fn persist_phase(&mut self) {
        if let Err(e) = self.state.persist() {
            error!(error = %e, "State persist failed");
        }
        if let Err(e) = self.learning.persist() {
            error!(error = %e, "Learning persist failed");
        }
        if let Some(store) = &self.store {
            let snapshot = self.state.snapshot();
            let _ = store.set_system_state("agent_mode", &snapshot.agent_mode.to_string());
            let _ = store.set_system_state("regime", self.detector.current().regime.as_str());
            let _ = store.set_system_state("cycle", &self.cycle.to_string());
        }
    }

    // ------------------------------------------------------------- plumbing

    fn note_reconcile(&mut self, status: ReconcileStatus) {
        if status == ReconcileStatus::Critical {
            self.consecutive_critical += 1;
        } else {
            self.consecutive_critical = 0;
        }
    }

    /// Regime-aware cycle interval: fast markets get fast cycles.
    fn cycle_interval(&self) -> Duration {
        let nominal = self.config.scan.interval_secs;
        let secs = match self.detector.current().regime {
            Regime::StrongBull => self.config.scan.min_interval_secs,
            Regime::Flat | Regime::StrongBear => self.config.scan.max_interval_secs,
            _ => nominal,
        };
        Duration::from_secs(secs.clamp(
            self.config.scan.min_interval_secs,
            self.config.scan.max_interval_secs,
        ))
    }
}

/// Await a future until a deadline; resolves to Err(()) past the deadline.
async fn timeout_at_or_zero<F, T>(deadline: Instant, future: F) -> Result<T, ()>
where
    F: std::future::Future<Output = T>,
{
    let now = Instant::now();
    if now >= deadline {
        return Err(());
    }
    timeout(deadline - now, future).await.map_err(|_| ())
}

#[cfg(unix)]
fn signal_stream() -> Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")
}

#[cfg(not(unix))]
fn signal_stream() -> Result<tokio::signal::windows::CtrlBreak> {
    tokio::signal::windows::ctrl_break().context("Failed to install ctrl-break handler")
}
