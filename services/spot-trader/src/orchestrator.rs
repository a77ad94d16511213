//! Trading orchestrator - the core decision loop
//!
//! Kline streams for every symbol are merged into one channel. Each update
//! first drives the open positions for that symbol through the lifecycle
//! state machine; a closed bar then extends the symbol's window and is
//! evaluated for a new entry through the ordered risk gates. Every decision
//! is written to the audit log.
//!
//! The peg watchdog, the heartbeat writer and the sentiment analysis task run
//! beside the loop and stop with it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amount::{split_symbol, SymbolFilters};
use crate::audit::DecisionAuditLog;
use crate::config::{Settings, TradingMode};
use crate::exchange::ExchangeClient;
use crate::executor::OrderExecutor;
use crate::governance::{AssetAllowlistPolicy, DoomFlag, StablecoinPegWatchdog};
use crate::lifecycle::{self, ClosedTrade, Decision};
use crate::llm::TextCompletion;
use crate::news::HeadlineSource;
use crate::oracle::{IntegrityCheck, PriceOracle, PriceVenue};
use crate::regime;
use crate::sentiment::{SentimentEngine, SentimentReading};
use crate::state::{NowState, SessionStats, StateManager};
use crate::store::{LedgerStore, PositionStore, TradeHistoryStore};
use crate::strategy::{position_size, signal_summary, BreakoutSignal, SignalSource};
use crate::types::{
    Bar, DecisionContext, Direction, EntryType, ExitReason, KlineEvent, Mood, OrderResult,
    OrderSide, Position, Regime, RiskCheck, TrailingConfig,
};

/// Sentinel file poll period
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MERGED_CHANNEL_CAPACITY: usize = 4096;

/// Every collaborator the orchestrator needs, injected explicitly
pub struct Components {
    pub settings: Settings,
    pub exchange: Arc<dyn ExchangeClient>,
    pub executor: Arc<OrderExecutor>,
    pub oracle: Arc<PriceOracle>,
    pub sentiment: Arc<SentimentEngine>,
    pub headlines: Arc<dyn HeadlineSource>,
    pub llm: Option<Arc<dyn TextCompletion>>,
    pub signals: Arc<dyn SignalSource>,
    pub allowlist: AssetAllowlistPolicy,
    pub doom: DoomFlag,
    pub positions: Arc<PositionStore>,
    pub ledger: Arc<LedgerStore>,
    pub trades: Arc<TradeHistoryStore>,
    pub audit: Arc<DecisionAuditLog>,
}

impl Components {
    /// Open the durable stores under `settings.data_dir` and build the
    /// default collaborators around the given clients
    pub async fn build(
        settings: Settings,
        exchange: Arc<dyn ExchangeClient>,
        venue: Arc<dyn PriceVenue>,
        llm: Option<Arc<dyn TextCompletion>>,
        headlines: Arc<dyn HeadlineSource>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.data_dir)
            .await
            .with_context(|| format!("failed to create {}", settings.data_dir.display()))?;

        let positions = PositionStore::open(&settings.positions_path())
            .await
            .context("failed to open position store")?;
        let ledger = LedgerStore::open(&settings.ledger_path(), settings.ledger.genesis_amount)
            .await
            .context("failed to open ledger")?;
        let trades = TradeHistoryStore::open(&settings.trades_path())
            .await
            .context("failed to open trade history")?;
        let audit = DecisionAuditLog::open(&settings.audit_path())
            .await
            .context("failed to open decision audit log")?;

        let allowlist = AssetAllowlistPolicy::from_settings(&settings.governance)?;
        let executor = OrderExecutor::new(
            settings.mode,
            exchange.clone(),
            Duration::from_secs(settings.exchange.order_timeout_secs),
        );
        let oracle = PriceOracle::new(venue, &settings.oracle);
        let sentiment = SentimentEngine::new(llm.clone());
        let signals = BreakoutSignal::from_settings(&settings.strategy);

        Ok(Self {
            settings,
            exchange,
            executor: Arc::new(executor),
            oracle: Arc::new(oracle),
            sentiment: Arc::new(sentiment),
            headlines,
            llm,
            signals: Arc::new(signals),
            allowlist,
            doom: DoomFlag::new(),
            positions: Arc::new(positions),
            ledger: Arc::new(ledger),
            trades: Arc::new(trades),
            audit: Arc::new(audit),
        })
    }
}

/// Counters shown in the heartbeat
#[derive(Debug, Default)]
struct Telemetry {
    decisions: u64,
    entries: u64,
    trades_closed: u64,
    realized_pnl: Decimal,
    last_decision_at: Option<DateTime<Utc>>,
}

/// Flags and readings shared with the side tasks
#[derive(Clone)]
pub struct SharedState {
    halted: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    sentiment: Arc<RwLock<SentimentReading>>,
    telemetry: Arc<Mutex<Telemetry>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            halted: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            sentiment: Arc::new(RwLock::new(SentimentReading::neutral())),
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
        }
    }

    /// New entries are refused after a persistence failure
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub async fn sentiment(&self) -> SentimentReading {
        self.sentiment.read().await.clone()
    }
}

/// Market facts recorded with every decision
#[derive(Debug, Clone, Copy)]
struct MarketView {
    sentiment: f64,
    mood: Mood,
    volatility: f64,
    regime: Regime,
}

pub struct TradingOrchestrator {
    c: Components,
    shared: SharedState,
    windows: HashMap<String, Vec<Bar>>,
    filters: HashMap<String, SymbolFilters>,
    analysis_trigger: Arc<Notify>,
}

impl TradingOrchestrator {
    pub fn new(components: Components) -> Self {
        Self {
            c: components,
            shared: SharedState::new(),
            windows: HashMap::new(),
            filters: HashMap::new(),
            analysis_trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle to the shared flags, usable after `run` consumes the orchestrator
    pub fn shared(&self) -> SharedState {
        self.shared.clone()
    }

    /// Run until `shutdown` turns true, the stop file appears or every kline
    /// stream ends
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.c.settings.mode {
            TradingMode::DryRun => info!("Running in DRY RUN mode, no orders reach the exchange"),
            TradingMode::Live => warn!("Running in LIVE mode - REAL MONEY AT RISK"),
        }

        self.bootstrap().await?;
        let (mut events, forwarders) = self.subscribe().await?;

        let (child_tx, child_rx) = watch::channel(false);
        let tasks = vec![
            self.spawn_watchdog(child_rx.clone()),
            self.spawn_heartbeat(child_rx.clone()).await?,
            self.spawn_analysis(child_rx),
        ];

        let stop_file = self.c.settings.stop_file_path();
        let mut stop_poll = interval(STOP_POLL_INTERVAL);

        info!(
            "Orchestrator running for {:?} ({} open positions, balance {})",
            self.c.settings.symbols,
            self.c.positions.len().await,
            self.c.ledger.current_balance().await
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("All kline streams ended");
                        break;
                    }
                },
                _ = stop_poll.tick() => {
                    if tokio::fs::try_exists(&stop_file).await.unwrap_or(false) {
                        info!("Stop file {} found", stop_file.display());
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;

        let _ = child_tx.send(true);
        for forwarder in forwarders {
            forwarder.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    /// Load filters and warm up the bar windows
    async fn bootstrap(&mut self) -> Result<()> {
        let symbols = self.c.settings.symbols.clone();
        for symbol in &symbols {
            let filters = self
                .c
                .exchange
                .get_symbol_filters(symbol)
                .await
                .with_context(|| format!("failed to load filters for {}", symbol))?;
            self.filters.insert(symbol.clone(), filters);

            let bars = self
                .c
                .exchange
                .get_klines(symbol, &self.c.settings.kline_interval, self.c.settings.history_bars)
                .await
                .with_context(|| format!("failed to load history for {}", symbol))?;
            if let Some(last) = bars.last() {
                self.c.executor.note_price(symbol, last.close);
            }
            info!("{}: {} bars of history", symbol, bars.len());
            self.windows.insert(symbol.clone(), bars);
        }
        Ok(())
    }

    /// One stream per symbol, merged into a single receiver
    async fn subscribe(&self) -> Result<(mpsc::Receiver<KlineEvent>, Vec<JoinHandle<()>>)> {
        let (tx, rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);
        let mut forwarders = Vec::new();

        for symbol in &self.c.settings.symbols {
            let mut stream = self
                .c
                .exchange
                .stream_klines(symbol, &self.c.settings.kline_interval)
                .await
                .with_context(|| format!("failed to subscribe to {}", symbol))?;
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(event) = stream.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }));
        }

        Ok((rx, forwarders))
    }

    fn spawn_watchdog(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let watchdog = StablecoinPegWatchdog::new(
            self.c.exchange.clone(),
            self.c.llm.clone(),
            self.c.doom.clone(),
            &self.c.settings.governance,
        );
        tokio::spawn(watchdog.run(shutdown))
    }

    async fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let state_manager = StateManager::new(&self.c.settings.data_dir);
        state_manager.init().await?;

        let heartbeat = Heartbeat {
            state_manager,
            shared: self.shared.clone(),
            positions: self.c.positions.clone(),
            ledger: self.c.ledger.clone(),
            doom: self.c.doom.clone(),
            mode: self.c.settings.mode,
            symbols: self.c.settings.symbols.clone(),
        };
        let period = Duration::from_secs(self.c.settings.heartbeat_secs.max(1));

        Ok(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => heartbeat.write("running").await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            heartbeat.write("stopped").await;
        }))
    }

    fn spawn_analysis(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.c.sentiment.clone();
        let source = self.c.headlines.clone();
        let reading = self.shared.sentiment.clone();
        let trigger = self.analysis_trigger.clone();
        let period = Duration::from_secs(self.c.settings.analysis.interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => info!("Win rate below threshold, refreshing sentiment early"),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let headlines = match source.fetch().await {
                    Ok(headlines) => headlines,
                    Err(e) => {
                        warn!("Headline fetch failed: {}", e);
                        continue;
                    }
                };
                let fresh = engine.analyze(&headlines).await;
                info!(
                    "Sentiment refreshed: {:.3} ({}) from {} headlines",
                    fresh.score,
                    fresh.mood(),
                    fresh.headline_count
                );
                *reading.write().await = fresh;
            }
        })
    }

    /// One kline update
    async fn handle_event(&mut self, event: KlineEvent) {
        let symbol = event.symbol.clone();
        let price = event.bar.close;
        self.c.executor.note_price(&symbol, price);

        self.manage_positions(&symbol, price, event.event_time).await;

        if event.is_closed {
            self.push_bar(&symbol, event.bar);
            self.evaluate_entry(&symbol, event.event_time).await;
        }
    }

    fn push_bar(&mut self, symbol: &str, bar: Bar) {
        let limit = self.c.settings.history_bars.max(1);
        let window = self.windows.entry(symbol.to_string()).or_default();
        match window.last() {
            Some(last) if last.open_time == bar.open_time => {
                if let Some(slot) = window.last_mut() {
                    *slot = bar;
                }
            }
            Some(last) if last.open_time > bar.open_time => {
                debug!("{}: ignoring out-of-order bar at {}", symbol, bar.open_time);
            }
            _ => window.push(bar),
        }
        if window.len() > limit {
            let excess = window.len() - limit;
            window.drain(..excess);
        }
    }

    async fn market_view(&self, symbol: &str) -> MarketView {
        let bars = self.windows.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
        let reading = self.shared.sentiment.read().await;
        MarketView {
            sentiment: reading.score,
            mood: reading.mood(),
            volatility: regime::volatility(bars, regime::ADX_PERIOD),
            regime: regime::classify(bars, self.c.settings.risk.adx_threshold),
        }
    }

    /// Drive every open position of `symbol` with the latest price
    async fn manage_positions(&mut self, symbol: &str, price: Decimal, at: DateTime<Utc>) {
        for mut position in self.c.positions.for_symbol(symbol).await {
            match lifecycle::evaluate(&mut position, price, at) {
                Decision::Stale => {}
                Decision::Hold { trailing_moved } => {
                    if trailing_moved {
                        debug!(
                            "{} trailing stop now {:?}",
                            position.id, position.trailing_stop
                        );
                        if let Err(e) = self.c.positions.update(position).await {
                            self.halt("position update", &e.to_string());
                        }
                    } else {
                        self.c.positions.mark_tick(position.id, at).await;
                    }
                }
                Decision::TakePartial { quantity, price } => {
                    self.take_partial(position, quantity, price, at).await;
                }
                Decision::Close { price, reason } => {
                    self.exit_position(position, price, at, reason).await;
                }
            }
        }
    }

    async fn take_partial(
        &mut self,
        mut position: Position,
        quantity: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) {
        let view = self.market_view(&position.symbol).await;
        let symbol = position.symbol.clone();

        let prepared = match self.filters.get(&symbol) {
            Some(filters) => filters.prepare(quantity, price).map_err(|v| v.to_string()),
            None => Ok(quantity),
        };

        let qty = match prepared {
            Ok(qty) => qty,
            Err(violation) => {
                // Too small to sell: lock in break-even and carry on
                lifecycle::apply_partial(&mut position, Decimal::ZERO, price);
                let id = position.id;
                if let Err(e) = self.c.positions.update(position).await {
                    self.halt("position update", &e.to_string());
                }
                self.record_decision(
                    &symbol,
                    "partial_take_profit",
                    view,
                    RiskCheck::blocked(format!(
                        "partial exit below exchange minimums ({}); stop moved to entry",
                        violation
                    )),
                    None,
                    Some(id),
                )
                .await;
                return;
            }
        };

        let is_buy = position.direction.exit_side() == OrderSide::Buy;
        let fill = match self.c.executor.place_market_order(&symbol, qty, is_buy).await {
            Ok(fill) if fill.is_filled() => fill,
            Ok(fill) => {
                self.c.positions.mark_tick(position.id, at).await;
                self.record_decision(
                    &symbol,
                    "partial_take_profit",
                    view,
                    RiskCheck::blocked(format!("partial exit not filled: {:?}", fill.status)),
                    Some(fill.order_id),
                    Some(position.id),
                )
                .await;
                return;
            }
            Err(e) => {
                // Retried on the next fresh tick
                self.c.positions.mark_tick(position.id, at).await;
                self.record_decision(
                    &symbol,
                    "partial_take_profit",
                    view,
                    RiskCheck::blocked(format!("partial exit order failed: {}", e)),
                    None,
                    Some(position.id),
                )
                .await;
                return;
            }
        };

        let pnl = lifecycle::apply_partial(&mut position, fill.executed_qty, fill.avg_price);
        let id = position.id;
        info!(
            "{} partial exit {} @ {} realized {} ({} remaining, stop {})",
            symbol, fill.executed_qty, fill.avg_price, pnl, position.quantity, position.stop_loss
        );

        if let Err(e) = self.c.positions.update(position).await {
            self.halt("position update", &e.to_string());
        }
        self.post_ledger(
            EntryType::RealizedPnl,
            pnl,
            &format!("partial exit {} {}", symbol, id),
        )
        .await;
        self.post_fee(&symbol, &fill).await;
        self.telemetry_pnl(pnl).await;

        self.record_decision(
            &symbol,
            "partial_take_profit",
            view,
            RiskCheck::approved(format!("+1R reached, took {} at {}", fill.executed_qty, fill.avg_price)),
            Some(fill.order_id),
            Some(id),
        )
        .await;
    }

    /// Close the remainder of a position through the executor
    async fn exit_position(
        &mut self,
        mut position: Position,
        price: Decimal,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) {
        let view = self.market_view(&position.symbol).await;
        let symbol = position.symbol.clone();
        let signal = match reason {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Shutdown => "shutdown_exit",
        };

        let qty = match self.filters.get(&symbol) {
            Some(filters) => {
                let qty = filters.quantize_qty(position.quantity);
                match filters.validate(qty, price) {
                    Ok(()) => qty,
                    Err(violation) => {
                        // Nothing sellable is left: book the remainder at the trigger price
                        warn!(
                            "{} remainder {} cannot be sold ({}); closing {} as dust",
                            symbol, position.quantity, violation, position.id
                        );
                        let closed = lifecycle::close(&mut position, price, at, reason);
                        self.book_exit(&position, closed, None).await;
                        self.record_decision(
                            &symbol,
                            signal,
                            view,
                            RiskCheck::approved(format!(
                                "{} at {}; remainder left as dust ({})",
                                reason, price, violation
                            )),
                            None,
                            Some(position.id),
                        )
                        .await;
                        self.check_win_rate().await;
                        return;
                    }
                }
            }
            None => position.quantity,
        };

        let is_buy = position.direction.exit_side() == OrderSide::Buy;
        let fill = match self.c.executor.place_market_order(&symbol, qty, is_buy).await {
            Ok(fill) if fill.is_filled() => fill,
            Ok(fill) => {
                self.c.positions.mark_tick(position.id, at).await;
                self.record_decision(
                    &symbol,
                    signal,
                    view,
                    RiskCheck::blocked(format!("exit at {} not filled: {:?}", price, fill.status)),
                    Some(fill.order_id),
                    Some(position.id),
                )
                .await;
                return;
            }
            Err(e) => {
                self.c.positions.mark_tick(position.id, at).await;
                self.record_decision(
                    &symbol,
                    signal,
                    view,
                    RiskCheck::blocked(format!("exit at {} failed: {}", price, e)),
                    None,
                    Some(position.id),
                )
                .await;
                return;
            }
        };

        if fill.executed_qty < qty {
            warn!(
                "{} exit filled {} of {}; closing the position record at {}",
                symbol, fill.executed_qty, qty, fill.avg_price
            );
        }

        let closed = lifecycle::close(&mut position, fill.avg_price, at, reason);
        self.book_exit(&position, closed, Some(&fill)).await;

        self.record_decision(
            &symbol,
            signal,
            view,
            RiskCheck::approved(format!("{} at {}", reason, fill.avg_price)),
            Some(fill.order_id),
            Some(position.id),
        )
        .await;

        self.check_win_rate().await;
    }

    /// Drop a closed position from the store and book its final leg
    async fn book_exit(
        &self,
        position: &Position,
        closed: ClosedTrade,
        fill: Option<&OrderResult>,
    ) {
        let symbol = &position.symbol;
        let reason = closed.record.exit_reason;
        info!(
            "{} closed ({}): exit {} pnl {} (final leg {})",
            symbol,
            reason,
            closed.record.exit_price,
            closed.record.realized_pnl,
            closed.final_pnl
        );

        if let Err(e) = self.c.positions.remove(position.id).await {
            self.halt("position removal", &e.to_string());
        }
        if let Err(e) = self.c.trades.append(closed.record).await {
            self.halt("trade history", &e.to_string());
        }
        self.post_ledger(
            EntryType::RealizedPnl,
            closed.final_pnl,
            &format!("{} {} {}", reason, symbol, position.id),
        )
        .await;
        if let Some(fill) = fill {
            self.post_fee(symbol, fill).await;
        }
        self.telemetry_pnl(closed.final_pnl).await;
        self.shared.telemetry.lock().await.trades_closed += 1;
    }

    async fn check_win_rate(&self) {
        let analysis = &self.c.settings.analysis;
        if let Some(rate) = self.c.trades.recent_win_rate(analysis.win_rate_window).await {
            if rate < analysis.min_win_rate {
                warn!(
                    "Win rate over last {} trades is {:.2} (< {:.2})",
                    analysis.win_rate_window, rate, analysis.min_win_rate
                );
                self.analysis_trigger.notify_one();
            }
        }
    }

    /// Ordered entry gates for a freshly closed bar
    async fn evaluate_entry(&mut self, symbol: &str, at: DateTime<Utc>) {
        let view = self.market_view(symbol).await;
        let bars = self.windows.get(symbol).cloned().unwrap_or_default();

        let Some(signal) = self.c.signals.evaluate(symbol, &bars) else {
            self.record_decision(symbol, "none", view, RiskCheck::blocked("no entry signal"), None, None)
                .await;
            return;
        };
        debug!("{}: {}", symbol, signal_summary(&signal));

        if let Err(reason) = self.check_gates(symbol, signal.direction, view).await {
            self.record_decision(symbol, &signal.name, view, RiskCheck::blocked(reason), None, None)
                .await;
            return;
        }

        let integrity = self.c.oracle.assess(symbol, signal.price).await;
        if !integrity.passed() {
            self.record_decision(
                symbol,
                &signal.name,
                view,
                RiskCheck::blocked(integrity.to_string()),
                None,
                None,
            )
            .await;
            return;
        }

        let balance = self.c.ledger.current_balance().await;
        let risk = &self.c.settings.risk;
        let size = position_size(
            balance * risk.risk_per_trade_pct / Decimal::ONE_HUNDRED,
            signal.risk_per_unit(),
            balance * risk.max_position_pct / Decimal::ONE_HUNDRED,
            signal.price,
        );
        if size <= Decimal::ZERO {
            self.record_decision(
                symbol,
                &signal.name,
                view,
                RiskCheck::blocked(format!("position size is zero (balance {})", balance)),
                None,
                None,
            )
            .await;
            return;
        }

        let qty = match self.filters.get(symbol) {
            Some(filters) => match filters.prepare(size, signal.price) {
                Ok(qty) => qty,
                Err(violation) => {
                    self.record_decision(
                        symbol,
                        &signal.name,
                        view,
                        RiskCheck::blocked(format!("order below exchange minimums: {}", violation)),
                        None,
                        None,
                    )
                    .await;
                    return;
                }
            },
            None => size,
        };

        let is_buy = signal.direction.entry_side() == OrderSide::Buy;
        let fill = match self.c.executor.place_market_order(symbol, qty, is_buy).await {
            Ok(fill) if fill.is_filled() => fill,
            Ok(fill) => {
                self.record_decision(
                    symbol,
                    &signal.name,
                    view,
                    RiskCheck::blocked(format!("entry not filled: {:?}", fill.status)),
                    Some(fill.order_id),
                    None,
                )
                .await;
                return;
            }
            Err(e) => {
                self.record_decision(
                    symbol,
                    &signal.name,
                    view,
                    RiskCheck::blocked(format!("entry order failed: {}", e)),
                    None,
                    None,
                )
                .await;
                return;
            }
        };

        let held = self.held_quantity(symbol, &fill);
        let trailing = risk.trailing.map(|t| {
            let initial_risk = (fill.avg_price - signal.stop_loss).abs();
            TrailingConfig {
                activation_price: fill.avg_price
                    + signal.direction.sign() * t.activation_r * initial_risk,
                distance: fill.avg_price * t.distance_pct / Decimal::ONE_HUNDRED,
            }
        });
        let position = Position::open(
            symbol,
            signal.direction,
            fill.avg_price,
            held,
            signal.stop_loss,
            signal.take_profit,
            trailing,
            at,
        );
        let position_id = position.id;

        info!(
            "{} opened {} {} @ {} stop {} target {} (order {})",
            symbol,
            position.direction,
            held,
            fill.avg_price,
            position.stop_loss,
            position.take_profit,
            fill.order_id
        );

        if let Err(e) = self.c.positions.insert(position).await {
            error!(
                "Position {} filled but could not be stored: {}",
                position_id, e
            );
            self.halt("position insert", &e.to_string());
        }
        self.post_fee(symbol, &fill).await;
        self.shared.telemetry.lock().await.entries += 1;

        self.record_decision(
            symbol,
            &signal.name,
            view,
            RiskCheck::approved(format!(
                "entry {} @ {} ({} integrity)",
                held,
                fill.avg_price,
                match integrity {
                    IntegrityCheck::Unverified { .. } => "unverified",
                    _ => "verified",
                }
            )),
            Some(fill.order_id.clone()),
            Some(position_id),
        )
        .await;
    }

    /// Gates that need no network call; `Err` carries the block reason
    async fn check_gates(
        &self,
        symbol: &str,
        direction: Direction,
        view: MarketView,
    ) -> std::result::Result<(), String> {
        if self.shared.is_halted() {
            return Err("halted after a persistence failure".to_string());
        }
        if self.shared.is_stopping() {
            return Err("stopping: no new entries".to_string());
        }
        if self.c.doom.is_raised() {
            return Err(format!(
                "doom mode: {} off peg, new entries blocked",
                self.c.settings.governance.peg_pair
            ));
        }
        self.c.allowlist.check(symbol)?;

        if !self.c.positions.for_symbol(symbol).await.is_empty() {
            return Err(format!("position already open for {}", symbol));
        }
        let open = self.c.positions.len().await;
        let max_open = self.c.settings.risk.max_open_positions;
        if open >= max_open {
            return Err(format!("max open positions reached ({}/{})", open, max_open));
        }

        let risk = &self.c.settings.risk;
        if risk.block_on_extreme_fear && direction == Direction::Long && view.mood == Mood::ExtremeFear {
            return Err(format!(
                "sentiment {:.3} is EXTREME_FEAR, long entries blocked",
                view.sentiment
            ));
        }
        if risk.require_trending && view.regime != Regime::Trending {
            return Err(format!("regime is {}, TRENDING required", view.regime));
        }
        Ok(())
    }

    /// Quantity actually held after a base-asset commission
    fn held_quantity(&self, symbol: &str, fill: &OrderResult) -> Decimal {
        match (split_symbol(symbol), fill.commission_asset.as_deref()) {
            (Some((base, _)), Some(asset)) if asset == base && fill.side == OrderSide::Buy => {
                (fill.executed_qty - fill.commission).max(Decimal::ZERO)
            }
            _ => fill.executed_qty,
        }
    }

    /// Commission as a FEE entry in quote terms
    async fn post_fee(&self, symbol: &str, fill: &OrderResult) {
        if fill.commission.is_zero() {
            return;
        }
        let Some(asset) = fill.commission_asset.as_deref() else {
            return;
        };
        let fee = match split_symbol(symbol) {
            Some((_, quote)) if asset == quote => fill.commission,
            Some((base, _)) if asset == base => fill.commission * fill.avg_price,
            _ => {
                warn!(
                    "Commission {} {} on order {} not booked (no {} price)",
                    fill.commission, asset, fill.order_id, asset
                );
                return;
            }
        };
        self.post_ledger(
            EntryType::Fee,
            -fee,
            &format!("commission {} {} order {}", fill.commission, asset, fill.order_id),
        )
        .await;
    }

    async fn post_ledger(&self, entry_type: EntryType, amount: Decimal, description: &str) {
        if let Err(e) = self.c.ledger.add_transaction(entry_type, amount, description).await {
            self.halt("ledger", &e.to_string());
        }
    }

    async fn telemetry_pnl(&self, pnl: Decimal) {
        self.shared.telemetry.lock().await.realized_pnl += pnl;
    }

    async fn record_decision(
        &self,
        symbol: &str,
        signal: &str,
        view: MarketView,
        risk_check: RiskCheck,
        order_id: Option<String>,
        position_id: Option<Uuid>,
    ) {
        if risk_check.approved {
            info!("{} {}: {}", symbol, signal, risk_check.reason);
        } else {
            debug!("{} {} blocked: {}", symbol, signal, risk_check.reason);
        }

        let context = DecisionContext {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            signal: signal.to_string(),
            sentiment: view.sentiment,
            volatility: view.volatility,
            regime: view.regime,
            risk_check,
            order_id,
            position_id,
        };
        if let Err(e) = self.c.audit.append(&context).await {
            self.halt("audit log", &e.to_string());
        }

        let mut telemetry = self.shared.telemetry.lock().await;
        telemetry.decisions += 1;
        telemetry.last_decision_at = Some(context.timestamp);
    }

    fn halt(&self, what: &str, err: &str) {
        if !self.shared.halted.swap(true, Ordering::SeqCst) {
            error!("Persistence failure in {}: {}. New entries halted", what, err);
        } else {
            error!("Persistence failure in {}: {}", what, err);
        }
    }

    /// Stop entries, optionally flatten, flush the durable logs
    async fn shutdown(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        info!("Stopping: new entries disabled");

        if self.c.settings.close_on_shutdown {
            let open = self.c.positions.all().await;
            info!("Closing {} open positions on shutdown", open.len());
            for position in open {
                let price = self
                    .c
                    .executor
                    .last_price(&position.symbol)
                    .unwrap_or(position.entry_price);
                self.exit_position(position, price, Utc::now(), ExitReason::Shutdown)
                    .await;
            }
        }

        if let Err(e) = self.c.audit.flush().await {
            error!("Failed to flush audit log: {}", e);
        }
        if let Err(e) = self.c.ledger.flush().await {
            error!("Failed to flush ledger: {}", e);
        }
        if let Err(e) = self.c.trades.flush().await {
            error!("Failed to flush trade history: {}", e);
        }

        let summary = self.c.ledger.summary().await;
        info!(
            "Final balance {} ({} ledger entries, realized {}), {} positions left open",
            summary.balance,
            summary.count,
            summary.total_realized_pnl,
            self.c.positions.len().await
        );
    }
}

/// Everything the heartbeat task reads
struct Heartbeat {
    state_manager: StateManager,
    shared: SharedState,
    positions: Arc<PositionStore>,
    ledger: Arc<LedgerStore>,
    doom: DoomFlag,
    mode: TradingMode,
    symbols: Vec<String>,
}

impl Heartbeat {
    async fn write(&self, status: &str) {
        let reading = self.shared.sentiment().await;
        let (stats, last_decision_at) = {
            let telemetry = self.shared.telemetry.lock().await;
            (
                SessionStats {
                    decisions: telemetry.decisions,
                    entries: telemetry.entries,
                    trades_closed: telemetry.trades_closed,
                    realized_pnl: telemetry.realized_pnl.to_string(),
                },
                telemetry.last_decision_at,
            )
        };

        let state = NowState {
            timestamp: Utc::now().to_rfc3339(),
            mode: match self.mode {
                TradingMode::DryRun => "dry_run".to_string(),
                TradingMode::Live => "live".to_string(),
            },
            status: if self.shared.is_halted() {
                "halted".to_string()
            } else {
                status.to_string()
            },
            symbols: self.symbols.clone(),
            open_positions: self.positions.len().await,
            balance: self.ledger.current_balance().await.to_string(),
            doom_mode: self.doom.is_raised(),
            halted: self.shared.is_halted(),
            sentiment: reading.score,
            mood: reading.mood().to_string(),
            last_decision_at: last_decision_at.map(|t| t.to_rfc3339()),
            session_stats: stats,
        };

        if let Err(e) = self.state_manager.write_now(&state).await {
            warn!("Heartbeat write failed: {}", e);
        }
    }
}
