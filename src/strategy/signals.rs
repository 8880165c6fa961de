use chrono::{DateTime, Utc};
use std::time::Duration;

use super::Strategy;
use crate::models::{
    ExitReason, IndicatorSnapshot, Position, PositionStatus, Side, Signal, SignalKind,
};

/// Loss (percent of entry) beyond which the holding limit waits for a
/// recovery or for twice the limit
pub const MAX_HOLD_LOSS_PCT: f64 = 2.0;

/// Exit reason for an open position at `price`, if any.
///
/// Take-profit is checked first, then stop-loss, then the holding limit.
/// An overdue position losing more than [`MAX_HOLD_LOSS_PCT`] is kept until
/// it has been held for twice the limit.
pub fn check_exit(
    position: &Position,
    price: f64,
    now: DateTime<Utc>,
    max_hold: Option<Duration>,
) -> Option<ExitReason> {
    let (take_profit_hit, stop_loss_hit) = match position.side {
        Side::Long => (price >= position.take_profit, price <= position.stop_loss),
        Side::Short => (price <= position.take_profit, price >= position.stop_loss),
    };

    if take_profit_hit {
        return Some(ExitReason::TakeProfit);
    }
    if stop_loss_hit {
        return Some(ExitReason::StopLoss);
    }

    let max_hold = max_hold.and_then(|d| chrono::Duration::from_std(d).ok())?;
    let held = now - position.opened_at;
    if held < max_hold {
        return None;
    }

    let pnl_pct = (price - position.entry_price) / position.entry_price * 100.0
        * position.side.sign();
    if pnl_pct > -MAX_HOLD_LOSS_PCT || held >= max_hold * 2 {
        return Some(ExitReason::MaxHoldTime);
    }

    tracing::warn!(
        symbol = %position.symbol,
        held_secs = held.num_seconds(),
        "holding limit reached at {:.2}%, waiting for recovery",
        pnl_pct
    );
    None
}

/// Turns indicator snapshots into one signal per symbol per cycle
pub struct SignalGenerator {
    strategy: Box<dyn Strategy>,
    max_hold: Option<Duration>,
}

impl SignalGenerator {
    pub fn new(strategy: Box<dyn Strategy>, max_hold: Option<Duration>) -> Self {
        Self { strategy, max_hold }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Signal for `current`, given the prior snapshot and any active position.
    ///
    /// A symbol with a position only ever yields EXIT or HOLD.
    pub fn generate(
        &self,
        current: &IndicatorSnapshot,
        prior: Option<&IndicatorSnapshot>,
        active: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Signal {
        let kind = match active {
            Some(position) if position.status == PositionStatus::Open => {
                check_exit(position, current.price, now, self.max_hold)
                    .map(SignalKind::Exit)
                    .unwrap_or(SignalKind::Hold)
            }
            Some(_) => SignalKind::Hold,
            None => self.strategy.entry_signal(current, prior),
        };

        Signal {
            symbol: current.symbol.clone(),
            kind,
            snapshot: current.clone(),
        }
    }
}
