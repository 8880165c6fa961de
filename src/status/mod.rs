// Status reporting: event log, trade statistics and snapshots
pub mod events;
pub mod performance;

pub use events::{EventLog, LogEvent, Severity};
pub use performance::{net_pnl, PerformanceStats, TradeRecord};

use performance::ALERT_LOSS_STREAK_WINDOW;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::execution::ledger::{PositionLedger, RiskBudget};
use crate::models::{IndicatorSnapshot, PositionStatus, Side};

/// Per-symbol line in the status report
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub price: Option<f64>,
    pub rsi: Option<f64>,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
    pub position: Option<PositionSummary>,
    /// Closed trades in this symbol during the session
    pub performance: PerformanceStats,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub side: Side,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub size: f64,
    pub notional: f64,
    pub margin: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub unrealized_pnl: Option<f64>,
    pub external: bool,
    pub opened_at: DateTime<Utc>,
}

/// Read-only view of the bot for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub cycles: u64,
    pub cycle_errors: u64,
    pub budget: RiskBudget,
    pub margin_utilization_pct: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub performance: PerformanceStats,
    pub win_rate_pct: f64,
    pub profit_factor: Option<f64>,
    /// Alerts over the whole session; per-symbol ones live in `symbols`
    pub alerts: Vec<String>,
    pub symbols: Vec<SymbolSummary>,
    pub recent_events: Vec<LogEvent>,
}

/// Counters owned by the control loop
#[derive(Debug, Clone, Copy)]
pub struct RunCounters {
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub cycle_errors: u64,
}

impl StatusSnapshot {
    pub fn build(
        counters: RunCounters,
        symbols: &[String],
        ledger: &PositionLedger,
        indicators: &HashMap<String, IndicatorSnapshot>,
        events: &EventLog,
        now: DateTime<Utc>,
    ) -> Self {
        let fee_pct = ledger.settings().trading_fee_pct;
        let prices: HashMap<String, f64> = indicators
            .iter()
            .map(|(symbol, snapshot)| (symbol.clone(), snapshot.price))
            .collect();

        let summaries = symbols
            .iter()
            .map(|symbol| {
                let snapshot = indicators.get(symbol);
                let price = snapshot.map(|s| s.price);
                let position = ledger.get(symbol).map(|p| PositionSummary {
                    side: p.side,
                    status: p.status,
                    entry_price: p.entry_price,
                    size: p.size,
                    notional: p.notional(),
                    margin: p.margin,
                    take_profit: p.take_profit,
                    stop_loss: p.stop_loss,
                    unrealized_pnl: match (p.status, price) {
                        (PositionStatus::Pending, _) | (_, None) => None,
                        (_, Some(price)) => {
                            Some(net_pnl(p.side, p.entry_price, price, p.size, fee_pct))
                        }
                    },
                    external: p.external,
                    opened_at: p.opened_at,
                });
                let performance = ledger.symbol_stats(symbol).cloned().unwrap_or_default();
                let recent = ledger.recent_pnls(Some(symbol), ALERT_LOSS_STREAK_WINDOW);
                let alerts = performance.risk_alerts(&recent);

                SymbolSummary {
                    symbol: symbol.clone(),
                    price,
                    rsi: snapshot.map(|s| s.rsi),
                    sma_short: snapshot.map(|s| s.sma_short),
                    sma_long: snapshot.map(|s| s.sma_long),
                    position,
                    performance,
                    alerts,
                }
            })
            .collect();

        let budget = ledger.budget();
        let stats = ledger.stats().clone();

        Self {
            running: counters.running,
            started_at: counters.started_at,
            uptime_secs: (now - counters.started_at).num_seconds().max(0),
            cycles: counters.cycles,
            cycle_errors: counters.cycle_errors,
            margin_utilization_pct: budget.utilization_pct(),
            budget,
            realized_pnl: stats.realized_pnl,
            unrealized_pnl: ledger.unrealized_pnl(&prices),
            win_rate_pct: stats.win_rate(),
            profit_factor: stats.profit_factor(),
            alerts: stats.risk_alerts(&ledger.recent_pnls(None, ALERT_LOSS_STREAK_WINDOW)),
            performance: stats,
            symbols: summaries,
            recent_events: events.recent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::LedgerSettings;
    use crate::models::{ExitReason, FillResult, FillStatus};

    #[test]
    fn test_snapshot_reports_positions_and_pnl() {
        let mut ledger = PositionLedger::new(LedgerSettings {
            total_margin: 1000.0,
            margin_ceiling: 0.75,
            take_profit_pct: 0.8,
            stop_loss_pct: 2.0,
            trading_fee_pct: 0.0,
            closed_history: 10,
            count_adopted_margin: true,
        });
        let now = Utc::now();
        let id = ledger
            .reserve("BTCUSDT", Side::Long, 30.0, 100.0, 300.0, now)
            .unwrap();
        ledger
            .confirm_open(
                "BTCUSDT",
                id,
                &FillResult {
                    order_id: "1".to_string(),
                    filled_size: 30.0,
                    avg_price: 100.0,
                    status: FillStatus::Filled,
                },
            )
            .unwrap();

        let mut indicators = HashMap::new();
        indicators.insert(
            "BTCUSDT".to_string(),
            IndicatorSnapshot {
                symbol: "BTCUSDT".to_string(),
                price: 101.0,
                rsi: 45.0,
                sma_short: 100.5,
                sma_long: 100.0,
                timestamp: now,
            },
        );

        let events = EventLog::new(10);
        events.success(Some("BTCUSDT"), "opened LONG");

        let snapshot = StatusSnapshot::build(
            RunCounters {
                running: true,
                started_at: now,
                cycles: 4,
                cycle_errors: 1,
            },
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &ledger,
            &indicators,
            &events,
            now,
        );

        assert_eq!(snapshot.symbols.len(), 2);
        let btc = &snapshot.symbols[0];
        assert_eq!(btc.price, Some(101.0));
        let position = btc.position.as_ref().unwrap();
        assert_eq!(position.unrealized_pnl, Some(30.0));
        assert!(snapshot.symbols[1].position.is_none());
        assert_eq!(snapshot.unrealized_pnl, 30.0);
        assert_eq!(snapshot.budget.committed, 300.0);
        assert!((snapshot.margin_utilization_pct - 40.0).abs() < 1e-9);
        assert_eq!(position.notional, 3000.0);
        assert_eq!(snapshot.recent_events.len(), 1);
        assert!(snapshot.alerts.is_empty());
        assert_eq!(btc.performance.total_trades, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["symbols"][0]["position"]["side"], "LONG");
    }

    #[test]
    fn test_alerts_follow_the_losing_symbol() {
        let mut ledger = PositionLedger::new(LedgerSettings {
            total_margin: 1000.0,
            margin_ceiling: 0.75,
            take_profit_pct: 0.8,
            stop_loss_pct: 2.0,
            trading_fee_pct: 0.0,
            closed_history: 10,
            count_adopted_margin: true,
        });
        let now = Utc::now();
        let id = ledger
            .reserve("ETHUSDT", Side::Long, 30.0, 100.0, 300.0, now)
            .unwrap();
        ledger
            .confirm_open(
                "ETHUSDT",
                id,
                &FillResult {
                    order_id: "7".to_string(),
                    filled_size: 30.0,
                    avg_price: 100.0,
                    status: FillStatus::Filled,
                },
            )
            .unwrap();
        ledger.begin_close("ETHUSDT", ExitReason::StopLoss).unwrap();
        ledger.confirm_closed("ETHUSDT", id, 95.0, now).unwrap();

        let snapshot = StatusSnapshot::build(
            RunCounters {
                running: true,
                started_at: now,
                cycles: 1,
                cycle_errors: 0,
            },
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &ledger,
            &HashMap::new(),
            &EventLog::new(10),
            now,
        );

        assert_eq!(snapshot.alerts, vec!["Realized P&L negative: -150.00"]);
        assert!(snapshot.symbols[0].alerts.is_empty());
        assert_eq!(snapshot.symbols[1].alerts, snapshot.alerts);
        assert_eq!(snapshot.symbols[1].performance.losing_trades, 1);
        assert!(snapshot.symbols[1].position.is_none());
    }
}
