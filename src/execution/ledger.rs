use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::BotError;
use crate::models::{ExitReason, FillResult, Position, PositionStatus, Side};
use crate::status::performance::{net_pnl, PerformanceStats, TradeRecord};
use crate::Result;

/// Ledger shared between the control loop, gateway and reconciler.
///
/// One lock guards both the margin budget and every position; it is never
/// held across an `.await`.
pub type SharedLedger = Arc<Mutex<PositionLedger>>;

/// Lock the shared ledger, recovering from a poisoned mutex
pub fn lock_ledger(ledger: &SharedLedger) -> MutexGuard<'_, PositionLedger> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Total account margin
    pub total_margin: f64,
    /// Fraction of `total_margin` that may be committed at once
    pub margin_ceiling: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trading_fee_pct: f64,
    /// Closed positions kept for reporting
    pub closed_history: usize,
    pub count_adopted_margin: bool,
}

/// Point-in-time view of margin usage
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RiskBudget {
    pub total_margin: f64,
    pub ceiling: f64,
    pub committed: f64,
    pub available: f64,
    pub active_positions: usize,
}

impl RiskBudget {
    pub fn utilization_pct(&self) -> f64 {
        if self.ceiling <= 0.0 {
            0.0
        } else {
            self.committed / self.ceiling * 100.0
        }
    }
}

/// Take-profit and stop-loss prices for an entry
pub fn protective_levels(side: Side, entry_price: f64, tp_pct: f64, sl_pct: f64) -> (f64, f64) {
    match side {
        Side::Long => (
            entry_price * (100.0 + tp_pct) / 100.0,
            entry_price * (100.0 - sl_pct) / 100.0,
        ),
        Side::Short => (
            entry_price * (100.0 - tp_pct) / 100.0,
            entry_price * (100.0 + sl_pct) / 100.0,
        ),
    }
}

/// Authoritative in-process record of positions and committed margin.
///
/// At most one non-closed position exists per symbol. Transitions:
/// PENDING -> OPEN -> CLOSING -> CLOSED, with PENDING removable on
/// rejection or timeout and CLOSING revertible to OPEN on a failed exit.
pub struct PositionLedger {
    settings: LedgerSettings,
    active: HashMap<String, Position>,
    closed: VecDeque<Position>,
    stats: PerformanceStats,
    symbol_stats: HashMap<String, PerformanceStats>,
}

impl PositionLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            settings,
            active: HashMap::new(),
            closed: VecDeque::new(),
            stats: PerformanceStats::default(),
            symbol_stats: HashMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn ceiling(&self) -> f64 {
        self.settings.total_margin * self.settings.margin_ceiling
    }

    /// Margin held by pending, open and closing positions
    pub fn committed_margin(&self) -> f64 {
        self.active
            .values()
            .filter(|p| self.settings.count_adopted_margin || !p.external)
            .map(|p| p.margin)
            .sum()
    }

    pub fn budget(&self) -> RiskBudget {
        let ceiling = self.ceiling();
        let committed = self.committed_margin();
        RiskBudget {
            total_margin: self.settings.total_margin,
            ceiling,
            committed,
            available: (ceiling - committed).max(0.0),
            active_positions: self.active.len(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.active.get(symbol)
    }

    pub fn has_active(&self, symbol: &str) -> bool {
        self.active.contains_key(symbol)
    }

    /// All non-closed positions
    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.active.values()
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.active
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .collect()
    }

    /// Recently closed positions, oldest first
    pub fn closed_positions(&self) -> &VecDeque<Position> {
        &self.closed
    }

    pub fn stats(&self) -> &PerformanceStats {
        &self.stats
    }

    /// Session statistics for one symbol; `None` before its first close
    pub fn symbol_stats(&self, symbol: &str) -> Option<&PerformanceStats> {
        self.symbol_stats.get(symbol)
    }

    /// Net P&L of the last `count` retained closes, oldest first.
    /// `symbol` narrows the history to one symbol.
    pub fn recent_pnls(&self, symbol: Option<&str>, count: usize) -> Vec<f64> {
        let mut pnls: Vec<f64> = self
            .closed
            .iter()
            .rev()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .filter_map(|p| p.realized_pnl)
            .take(count)
            .collect();
        pnls.reverse();
        pnls
    }

    /// Insert a PENDING placeholder holding `margin`
    pub fn reserve(
        &mut self,
        symbol: &str,
        side: Side,
        size: f64,
        price: f64,
        margin: f64,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        if let Some(existing) = self.active.get(symbol) {
            return Err(BotError::validation(
                symbol,
                format!("already holds a {:?} position", existing.status),
            ));
        }

        let (take_profit, stop_loss) = self.levels(side, price);
        let id = Uuid::new_v4();
        self.active.insert(
            symbol.to_string(),
            Position {
                id,
                symbol: symbol.to_string(),
                side,
                entry_price: price,
                size,
                margin,
                take_profit,
                stop_loss,
                opened_at: now,
                status: PositionStatus::Pending,
                external: false,
                order_id: None,
                exit_price: None,
                exit_reason: None,
                realized_pnl: None,
                closed_at: None,
            },
        );

        Ok(id)
    }

    /// PENDING -> OPEN at the filled size and price.
    ///
    /// A partial fill keeps the position at the filled size and releases the
    /// unfilled share of the reservation.
    pub fn confirm_open(&mut self, symbol: &str, id: Uuid, fill: &FillResult) -> Result<Position> {
        if !(fill.filled_size > 0.0 && fill.avg_price > 0.0) {
            return Err(BotError::validation(
                symbol,
                format!(
                    "fill {} has no executed size ({} @ {})",
                    fill.order_id, fill.filled_size, fill.avg_price
                ),
            ));
        }

        let (tp_pct, sl_pct) = (self.settings.take_profit_pct, self.settings.stop_loss_pct);
        let position = self.expect_status(symbol, id, PositionStatus::Pending)?;

        let fill_ratio = (fill.filled_size / position.size).min(1.0);
        position.margin *= fill_ratio;
        position.size = fill.filled_size;
        position.entry_price = fill.avg_price;
        let (take_profit, stop_loss) =
            protective_levels(position.side, fill.avg_price, tp_pct, sl_pct);
        position.take_profit = take_profit;
        position.stop_loss = stop_loss;
        position.order_id = Some(fill.order_id.clone());
        position.status = PositionStatus::Open;

        Ok(position.clone())
    }

    /// Drop a PENDING reservation, returning it. No-op if `id` is not pending.
    pub fn release(&mut self, symbol: &str, id: Uuid) -> Option<Position> {
        match self.active.get(symbol) {
            Some(p) if p.id == id && p.status == PositionStatus::Pending => {
                self.active.remove(symbol)
            }
            _ => None,
        }
    }

    /// Release every PENDING reservation older than `timeout`
    pub fn expire_pending(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<Position> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<String> = self
            .active
            .values()
            .filter(|p| p.status == PositionStatus::Pending && now - p.opened_at >= timeout)
            .map(|p| p.symbol.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|symbol| self.active.remove(&symbol))
            .collect()
    }

    /// OPEN -> CLOSING. Returns `None` when there is nothing to close or an
    /// exit is already in flight, so concurrent exits collapse into one.
    pub fn begin_close(&mut self, symbol: &str, reason: ExitReason) -> Option<Position> {
        let position = self.active.get_mut(symbol)?;
        if position.status != PositionStatus::Open {
            return None;
        }
        position.status = PositionStatus::Closing;
        position.exit_reason = Some(reason);
        Some(position.clone())
    }

    /// CLOSING -> OPEN after an exit order failed
    pub fn abort_close(&mut self, symbol: &str, id: Uuid) -> bool {
        match self.active.get_mut(symbol) {
            Some(p) if p.id == id && p.status == PositionStatus::Closing => {
                p.status = PositionStatus::Open;
                p.exit_reason = None;
                true
            }
            _ => false,
        }
    }

    /// CLOSING -> CLOSED on exit fill confirmation
    pub fn confirm_closed(
        &mut self,
        symbol: &str,
        id: Uuid,
        exit_price: f64,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord> {
        let position = self.expect_status(symbol, id, PositionStatus::Closing)?;
        let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
        self.finish(symbol, exit_price, reason, now)
    }

    /// Mark an OPEN or CLOSING position as closed on the exchange's word
    pub fn close_external(
        &mut self,
        symbol: &str,
        exit_price: f64,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord> {
        match self.active.get(symbol).map(|p| p.status) {
            Some(PositionStatus::Open) | Some(PositionStatus::Closing) => {
                self.finish(symbol, exit_price, ExitReason::External, now)
            }
            Some(status) => Err(BotError::validation(
                symbol,
                format!("cannot close a {:?} position externally", status),
            )),
            None => Err(BotError::validation(symbol, "no active position")),
        }
    }

    /// Take over a position the exchange reports but the ledger lacks.
    ///
    /// Protective levels are assigned immediately so the position is eligible
    /// for exit monitoring.
    pub fn adopt(
        &mut self,
        symbol: &str,
        side: Side,
        size: f64,
        entry_price: f64,
        margin: f64,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        if self.active.contains_key(symbol) {
            return Err(BotError::validation(symbol, "already tracked"));
        }

        let (take_profit, stop_loss) = self.levels(side, entry_price);
        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            size,
            margin,
            take_profit,
            stop_loss,
            opened_at: now,
            status: PositionStatus::Open,
            external: true,
            order_id: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            closed_at: None,
        };
        self.active.insert(symbol.to_string(), position.clone());
        Ok(position)
    }

    /// Align size with the exchange; committed margin scales with it
    pub fn adjust_size(&mut self, symbol: &str, size: f64) -> Result<Position> {
        let position = self
            .active
            .get_mut(symbol)
            .ok_or_else(|| BotError::validation(symbol, "no active position"))?;
        if position.size > 0.0 {
            position.margin *= size / position.size;
        }
        position.size = size;
        Ok(position.clone())
    }

    /// Unrealized net P&L across open positions at the given prices
    pub fn unrealized_pnl(&self, prices: &HashMap<String, f64>) -> f64 {
        self.active
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .filter_map(|p| {
                prices.get(&p.symbol).map(|&price| {
                    net_pnl(p.side, p.entry_price, price, p.size, self.settings.trading_fee_pct)
                })
            })
            .sum()
    }

    fn levels(&self, side: Side, price: f64) -> (f64, f64) {
        protective_levels(
            side,
            price,
            self.settings.take_profit_pct,
            self.settings.stop_loss_pct,
        )
    }

    fn expect_status(
        &mut self,
        symbol: &str,
        id: Uuid,
        expected: PositionStatus,
    ) -> Result<&mut Position> {
        match self.active.get_mut(symbol) {
            Some(p) if p.id == id && p.status == expected => Ok(p),
            Some(p) => Err(BotError::validation(
                symbol,
                format!(
                    "position {} is {:?}, expected {} to be {:?}",
                    p.id, p.status, id, expected
                ),
            )),
            None => Err(BotError::validation(
                symbol,
                format!("position {} not found", id),
            )),
        }
    }

    fn finish(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord> {
        let mut position = self
            .active
            .remove(symbol)
            .ok_or_else(|| BotError::validation(symbol, "no active position"))?;

        let pnl = net_pnl(
            position.side,
            position.entry_price,
            exit_price,
            position.size,
            self.settings.trading_fee_pct,
        );
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(reason);
        position.realized_pnl = Some(pnl);
        position.closed_at = Some(now);

        let trade = TradeRecord::from_position(&position).ok_or_else(|| {
            BotError::validation(symbol, "closed position is missing exit details")
        })?;
        self.stats.record(&trade);
        self.symbol_stats
            .entry(trade.symbol.clone())
            .or_default()
            .record(&trade);

        self.closed.push_back(position);
        while self.closed.len() > self.settings.closed_history {
            self.closed.pop_front();
        }

        Ok(trade)
    }
}
