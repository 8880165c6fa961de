use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ExitReason, Position, Side};

pub const ALERT_MIN_TRADES: usize = 10;
const ALERT_MIN_WIN_RATE_PCT: f64 = 40.0;
/// Latest closes inspected for a losing streak
pub const ALERT_LOSS_STREAK_WINDOW: usize = 5;
const ALERT_LOSS_STREAK: usize = 3;
/// Quote-asset loss that raises an alert regardless of trade count
const ALERT_MIN_REALIZED_PNL: f64 = -100.0;

/// Record of a single completed round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    /// Net of entry and exit fees
    pub pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_secs: i64,
}

impl TradeRecord {
    pub fn from_position(position: &Position) -> Option<Self> {
        let (exit_price, reason, pnl, closed_at) = (
            position.exit_price?,
            position.exit_reason?,
            position.realized_pnl?,
            position.closed_at?,
        );

        Some(Self {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl,
            reason,
            opened_at: position.opened_at,
            closed_at,
            duration_secs: (closed_at - position.opened_at).num_seconds(),
        })
    }
}

/// P&L of a round trip net of the fee charged on both legs
pub fn net_pnl(side: Side, entry_price: f64, exit_price: f64, size: f64, fee_pct: f64) -> f64 {
    let gross = (exit_price - entry_price) * size * side.sign();
    let fee_rate = fee_pct / 100.0;
    let fees = (entry_price * size + exit_price * size) * fee_rate;
    gross - fees
}

/// Running session statistics, updated on every close
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub realized_pnl: f64,
    /// Entry plus exit notional traded
    pub total_volume: f64,
}

impl PerformanceStats {
    pub fn record(&mut self, trade: &TradeRecord) {
        self.total_trades += 1;
        self.realized_pnl += trade.pnl;
        self.total_volume += (trade.entry_price + trade.exit_price) * trade.size;

        if trade.pnl > 0.0 {
            self.winning_trades += 1;
            self.gross_profit += trade.pnl;
        } else if trade.pnl < 0.0 {
            self.losing_trades += 1;
            self.gross_loss += trade.pnl.abs();
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64 * 100.0
        }
    }

    /// Gross profit over gross loss; `None` while there are no losses
    pub fn profit_factor(&self) -> Option<f64> {
        (self.gross_loss > 0.0).then(|| self.gross_profit / self.gross_loss)
    }

    /// Human-readable warnings about degrading performance.
    ///
    /// Rate-based alerts need `ALERT_MIN_TRADES` closes first. `recent_pnls`
    /// holds the latest closes, oldest first.
    pub fn risk_alerts(&self, recent_pnls: &[f64]) -> Vec<String> {
        let mut alerts = Vec::new();

        if self.total_trades >= ALERT_MIN_TRADES {
            let win_rate = self.win_rate();
            if win_rate < ALERT_MIN_WIN_RATE_PCT {
                alerts.push(format!("Low win rate: {:.1}%", win_rate));
            }

            if let Some(pf) = self.profit_factor().filter(|pf| *pf < 1.0) {
                alerts.push(format!("Profit factor below 1: {:.2}", pf));
            }

            let window = &recent_pnls[recent_pnls.len().saturating_sub(ALERT_LOSS_STREAK_WINDOW)..];
            let losses = window.iter().filter(|pnl| **pnl < 0.0).count();
            if losses >= ALERT_LOSS_STREAK {
                alerts.push(format!(
                    "{} losses in the last {} trades",
                    losses,
                    window.len()
                ));
            }
        }

        if self.realized_pnl < ALERT_MIN_REALIZED_PNL {
            alerts.push(format!("Realized P&L negative: {:.2}", self.realized_pnl));
        }

        alerts
    }
}
