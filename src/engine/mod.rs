//! Control loop and lifecycle surface.
//!
//! One task drives every symbol sequentially on a fixed interval. The ledger
//! is the only state shared with the outside, through [`BotHandle`].

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::api::ExchangeClient;
use crate::config::BotConfig;
use crate::error::BotError;
use crate::execution::{
    lock_ledger, ExecutionGateway, LedgerSettings, PositionLedger, RetryPolicy, SharedLedger,
};
use crate::market_data::MarketDataAdapter;
use crate::models::{ExitReason, PositionStatus, SignalKind, SymbolConfig};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::risk::{Admission, RiskManager};
use crate::strategy::{check_exit, RsiCrossover, SignalGenerator};
use crate::status::{EventLog, RunCounters, StatusSnapshot, TradeRecord};
use crate::Result;

/// Counters shared between the loop task and status readers
#[derive(Debug)]
struct LoopCounters {
    started_at: DateTime<Utc>,
    running: AtomicBool,
    cycles: AtomicU64,
    cycle_errors: AtomicU64,
}

impl LoopCounters {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
            cycle_errors: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> RunCounters {
        RunCounters {
            running: self.running.load(Ordering::SeqCst),
            started_at: self.started_at,
            cycles: self.cycles.load(Ordering::SeqCst),
            cycle_errors: self.cycle_errors.load(Ordering::SeqCst),
        }
    }
}

/// Requests from a [`BotHandle`], served by the loop task between cycles
#[derive(Debug)]
pub enum Command {
    /// Flatten one symbol, or every open position when `symbol` is `None`
    ClosePositions {
        symbol: Option<String>,
        reply: oneshot::Sender<Result<Vec<TradeRecord>>>,
    },
}

/// Everything one run of the bot owns. Built at start, dropped at stop.
pub struct BotContext {
    pub config: BotConfig,
    pub ledger: SharedLedger,
    pub events: EventLog,
    pub market_data: Arc<MarketDataAdapter>,
    pub signals: SignalGenerator,
    pub risk: RiskManager,
    pub gateway: ExecutionGateway,
    pub reconciler: Reconciler,
}

impl BotContext {
    pub fn new(config: BotConfig, exchange: Arc<dyn ExchangeClient>, total_margin: f64) -> Self {
        let events = EventLog::new(config.event_log_capacity);
        let ledger = PositionLedger::new(LedgerSettings {
            total_margin,
            margin_ceiling: config.margin_ceiling,
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
            trading_fee_pct: config.trading_fee_pct,
            closed_history: config.closed_history,
            count_adopted_margin: config.adopted_positions_count_against_ceiling,
        })
        .into_shared();

        let market_data = Arc::new(MarketDataAdapter::new(
            exchange.clone(),
            config.strategy.clone(),
            config.kline_interval.clone(),
            config.kline_limit,
            config.request_timeout,
        ));
        let signals = SignalGenerator::new(
            Box::new(RsiCrossover::new(config.strategy.clone())),
            config.max_hold,
        );
        let risk = RiskManager::new(
            config.margin_per_trade,
            config.leverage,
            config.max_concurrent_positions,
        );
        let gateway = ExecutionGateway::new(
            exchange.clone(),
            ledger.clone(),
            events.clone(),
            RetryPolicy {
                max_attempts: config.max_order_attempts,
                base_delay: config.retry_base_delay,
                attempt_timeout: config.request_timeout,
                ..RetryPolicy::default()
            },
        );
        let reconciler = Reconciler::new(
            exchange,
            ledger.clone(),
            events.clone(),
            config.symbol_names(),
            config.leverage,
            config.request_timeout,
        );

        Self {
            config,
            ledger,
            events,
            market_data,
            signals,
            risk,
            gateway,
            reconciler,
        }
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub errors: u64,
    pub expired: usize,
    pub reconciled: Option<ReconcileReport>,
}

pub struct ControlLoop {
    ctx: BotContext,
    counters: Arc<LoopCounters>,
}

impl ControlLoop {
    pub fn new(ctx: BotContext) -> Self {
        Self {
            ctx,
            counters: Arc::new(LoopCounters::new()),
        }
    }

    pub fn context(&self) -> &BotContext {
        &self.ctx
    }

    pub fn status(&self) -> StatusSnapshot {
        build_status(&self.ctx, &self.counters)
    }

    /// Run a single cycle: expire stale reservations, evaluate every symbol,
    /// sweep exits, and reconcile on its cadence.
    ///
    /// Failures are contained per symbol; this never returns an error.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.counters.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        // Step 1: release reservations that never resolved
        let expired =
            lock_ledger(&self.ctx.ledger).expire_pending(Utc::now(), self.ctx.config.pending_timeout);
        for position in &expired {
            self.ctx.events.warning(
                Some(&position.symbol),
                format!(
                    "Pending {:?} reservation expired, {:.2} margin released",
                    position.side, position.margin
                ),
            );
        }
        report.expired = expired.len();

        // Step 2: per-symbol evaluation
        let mut evaluated = HashSet::new();
        for symbol in self.ctx.config.symbols.clone() {
            match self.process_symbol(&symbol).await {
                Ok(()) => {
                    evaluated.insert(symbol.symbol.clone());
                }
                Err(e) => {
                    report.errors += 1;
                    self.ctx
                        .events
                        .error(Some(&symbol.symbol), format!("Cycle skipped: {}", e));
                }
            }
        }

        // Step 3: exits for positions whose symbol was not evaluated above
        report.errors += self.sweep_exits(&evaluated).await;

        // Step 4: reconciliation between cycles
        if cycle % self.ctx.config.reconcile_every_cycles == 0 {
            match self.reconcile().await {
                Ok(reconciled) => report.reconciled = Some(reconciled),
                Err(e) => {
                    report.errors += 1;
                    self.ctx
                        .events
                        .error(None, format!("Reconciliation failed: {}", e));
                }
            }
        }

        self.counters
            .cycle_errors
            .fetch_add(report.errors, Ordering::SeqCst);
        tracing::debug!(cycle, errors = report.errors, "cycle complete");
        report
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let prices = self.ctx.market_data.latest_prices();
        self.ctx.reconciler.reconcile(&prices).await
    }

    async fn process_symbol(&self, symbol: &SymbolConfig) -> Result<()> {
        let name = symbol.symbol.as_str();
        let current = self.ctx.market_data.get_indicators(name).await?;
        let prior = self.ctx.market_data.prior(name);
        let active = lock_ledger(&self.ctx.ledger).get(name).cloned();

        let signal = self
            .ctx
            .signals
            .generate(&current, prior.as_ref(), active.as_ref(), Utc::now());

        match signal.kind {
            SignalKind::Hold => Ok(()),
            SignalKind::Exit(reason) => {
                self.ctx.gateway.close(name, reason, current.price).await?;
                Ok(())
            }
            SignalKind::LongEntry | SignalKind::ShortEntry => {
                let admission = {
                    let mut ledger = lock_ledger(&self.ctx.ledger);
                    self.ctx.risk.admit(&mut ledger, &signal, symbol, Utc::now())?
                };

                match admission {
                    Admission::Approved(intent) => {
                        self.ctx.events.info(
                            Some(name),
                            format!(
                                "{:?} signal: RSI {:.1}, SMA {:.4}/{:.4}, submitting {} @ ~{:.4}",
                                signal.kind,
                                current.rsi,
                                current.sma_short,
                                current.sma_long,
                                intent.size,
                                current.price
                            ),
                        );
                        self.ctx.gateway.open(&intent).await?;
                    }
                    Admission::Rejected(reason) => {
                        self.ctx.events.info(
                            Some(name),
                            format!("{:?} signal not taken: {}", signal.kind, reason),
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Check protective levels for open positions skipped by the symbol pass.
    /// Returns the number of failed exits.
    async fn sweep_exits(&self, evaluated: &HashSet<String>) -> u64 {
        let prices = self.ctx.market_data.latest_prices();
        let now = Utc::now();
        let due: Vec<(String, ExitReason, f64)> = lock_ledger(&self.ctx.ledger)
            .open_positions()
            .into_iter()
            .filter(|p| !evaluated.contains(&p.symbol))
            .filter_map(|p| {
                let price = prices.get(&p.symbol).copied()?;
                check_exit(p, price, now, self.ctx.config.max_hold)
                    .map(|reason| (p.symbol.clone(), reason, price))
            })
            .collect();

        let mut failures = 0;
        for (symbol, reason, price) in due {
            if let Err(e) = self.ctx.gateway.close(&symbol, reason, price).await {
                failures += 1;
                tracing::debug!(symbol = %symbol, "exit sweep: {}", e);
            }
        }
        failures
    }

    /// Close positions on request, with reason MANUAL.
    ///
    /// A named symbol must be configured and its close failure is returned.
    /// With `None` every OPEN position is attempted and failures are skipped.
    pub async fn close_positions(&self, symbol: Option<&str>) -> Result<Vec<TradeRecord>> {
        let prices = self.ctx.market_data.latest_prices();

        let trades = match symbol {
            Some(name) => {
                if self.ctx.config.symbol(name).is_none() {
                    return Err(BotError::validation(name, "not a configured symbol"));
                }
                let price = {
                    let ledger = lock_ledger(&self.ctx.ledger);
                    ledger
                        .get(name)
                        .filter(|p| p.status == PositionStatus::Open)
                        .map(|p| prices.get(name).copied().unwrap_or(p.entry_price))
                };
                match price {
                    Some(price) => self
                        .ctx
                        .gateway
                        .close(name, ExitReason::Manual, price)
                        .await?
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                }
            }
            None => self.ctx.gateway.close_all(ExitReason::Manual, &prices).await,
        };

        self.ctx.events.info(
            symbol,
            format!("Manual close: {} positions closed", trades.len()),
        );
        Ok(trades)
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::ClosePositions { symbol, reply } => {
                let result = self.close_positions(symbol.as_deref()).await;
                // Err means the caller stopped waiting
                let _ = reply.send(result);
            }
        }
    }

    /// Drive cycles until `shutdown` flips to true, then wind down.
    ///
    /// A cycle in flight always runs to completion, and no cycle starts once
    /// the stop has been sent. Commands are served between cycles.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut ticker = interval_at(Instant::now(), self.ctx.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.run_cycle().await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop trading and optionally flatten every open position
    pub async fn shutdown(&mut self) {
        self.counters.running.store(false, Ordering::SeqCst);
        self.ctx.events.info(None, "Stopping control loop");

        if self.ctx.config.close_positions_on_shutdown {
            let prices = self.ctx.market_data.latest_prices();
            let trades = self
                .ctx
                .gateway
                .close_all(ExitReason::Shutdown, &prices)
                .await;
            let left = lock_ledger(&self.ctx.ledger)
                .active_positions()
                .filter(|p| p.status == PositionStatus::Open)
                .count();
            if left > 0 {
                self.ctx.events.warning(
                    None,
                    format!("{} positions still open after shutdown close", left),
                );
            } else if !trades.is_empty() {
                self.ctx
                    .events
                    .info(None, format!("Closed {} positions on shutdown", trades.len()));
            }
        }
    }
}

fn build_status(ctx: &BotContext, counters: &LoopCounters) -> StatusSnapshot {
    let snapshots = ctx.market_data.latest_snapshots();
    let ledger = lock_ledger(&ctx.ledger);
    StatusSnapshot::build(
        counters.snapshot(),
        &ctx.config.symbol_names(),
        &ledger,
        &snapshots,
        &ctx.events,
        Utc::now(),
    )
}

const COMMAND_QUEUE: usize = 8;

/// Entry point of the lifecycle surface
pub struct Bot;

impl Bot {
    /// Prepare the account, sync with the exchange, and spawn the loop.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(config: BotConfig, exchange: Arc<dyn ExchangeClient>) -> Result<BotHandle> {
        let total_margin = match config.total_margin {
            Some(margin) => margin,
            None => {
                tokio::time::timeout(config.request_timeout, exchange.account_balance())
                    .await
                    .map_err(|_| BotError::Transport("balance query timed out".to_string()))??
            }
        };
        if !total_margin.is_finite() || total_margin <= 0.0 {
            return Err(BotError::Configuration(format!(
                "no margin available to trade (balance {})",
                total_margin
            )));
        }

        for symbol in &config.symbols {
            if let Err(e) = exchange.set_leverage(&symbol.symbol, symbol.leverage).await {
                tracing::warn!(symbol = %symbol.symbol, "could not set leverage: {}", e);
            }
        }

        let ctx = BotContext::new(config, exchange, total_margin);
        ctx.events.info(
            None,
            format!(
                "Starting {}: {} symbols, margin {:.2}, ceiling {:.0}%, {}% per trade, {}x",
                ctx.signals.strategy_name(),
                ctx.config.symbols.len(),
                total_margin,
                ctx.config.margin_ceiling * 100.0,
                ctx.config.margin_per_trade.percent(),
                ctx.config.leverage
            ),
        );

        let control = ControlLoop::new(ctx);
        // Pick up positions that were already open before we started
        if let Err(e) = control.reconcile().await {
            control
                .ctx
                .events
                .warning(None, format!("Initial position sync failed: {}", e));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = BotHandle {
            ledger: control.ctx.ledger.clone(),
            events: control.ctx.events.clone(),
            market_data: control.ctx.market_data.clone(),
            counters: control.counters.clone(),
            symbols: control.ctx.config.symbol_names(),
            commands: commands_tx,
            shutdown: Some(shutdown_tx),
            task: None,
        };

        let task = tokio::spawn(control.run(shutdown_rx, commands_rx));

        Ok(BotHandle {
            task: Some(task),
            ..handle
        })
    }
}

/// Control surface for a running bot
pub struct BotHandle {
    ledger: SharedLedger,
    events: EventLog,
    market_data: Arc<MarketDataAdapter>,
    counters: Arc<LoopCounters>,
    symbols: Vec<String>,
    commands: mpsc::Sender<Command>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl BotHandle {
    pub fn status(&self) -> StatusSnapshot {
        let snapshots = self.market_data.latest_snapshots();
        let ledger = lock_ledger(&self.ledger);
        StatusSnapshot::build(
            self.counters.snapshot(),
            &self.symbols,
            &ledger,
            &snapshots,
            &self.events,
            Utc::now(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// Manually close `symbol`, or every open position when `None`.
    ///
    /// Served by the loop task once the current cycle finishes.
    pub async fn close_positions(&self, symbol: Option<String>) -> Result<Vec<TradeRecord>> {
        let target = symbol.clone().unwrap_or_else(|| "all symbols".to_string());
        let stopped = || BotError::validation(target.as_str(), "control loop is not running");

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::ClosePositions { symbol, reply })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    /// Halt new cycles, let the current one finish, then wind down.
    ///
    /// Returns the final status.
    pub async fn stop(mut self) -> StatusSnapshot {
        if let Some(tx) = self.shutdown.take() {
            // Err means the loop already exited
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("control loop task failed: {}", e);
                self.counters.running.store(false, Ordering::SeqCst);
            }
        }
        self.status()
    }
}
