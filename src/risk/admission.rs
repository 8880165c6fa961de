use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::config::MarginFraction;
use crate::error::BotError;
use crate::execution::ledger::PositionLedger;
use crate::models::{OrderIntent, OrderType, Signal, SymbolConfig};
use crate::Result;

/// Why an entry signal was not turned into an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    MarginExceeded,
    SymbolAlreadyOpen,
    MaxPositionsReached,
    BelowMinNotional,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            RejectReason::MarginExceeded => "MARGIN_EXCEEDED",
            RejectReason::SymbolAlreadyOpen => "SYMBOL_ALREADY_OPEN",
            RejectReason::MaxPositionsReached => "MAX_POSITIONS_REACHED",
            RejectReason::BelowMinNotional => "BELOW_MIN_NOTIONAL",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone)]
pub enum Admission {
    /// PENDING placeholder already reserved in the ledger
    Approved(OrderIntent),
    Rejected(RejectReason),
}

/// Validates entry signals against the risk budget
#[derive(Debug, Clone)]
pub struct RiskManager {
    margin_per_trade: MarginFraction,
    leverage: u32,
    max_concurrent: usize,
}

impl RiskManager {
    pub fn new(margin_per_trade: MarginFraction, leverage: u32, max_concurrent: usize) -> Self {
        Self {
            margin_per_trade,
            leverage,
            max_concurrent,
        }
    }

    /// Decide on an entry signal and, if approved, reserve its margin.
    ///
    /// Decision and reservation happen on the same `&mut` ledger, so callers
    /// holding the ledger lock get them atomically.
    pub fn admit(
        &self,
        ledger: &mut PositionLedger,
        signal: &Signal,
        symbol: &SymbolConfig,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let side = signal.kind.entry_side().ok_or_else(|| {
            BotError::validation(
                &signal.symbol,
                format!("{:?} is not an entry signal", signal.kind),
            )
        })?;
        let price = signal.snapshot.price;
        if !price.is_finite() || price <= 0.0 {
            return Err(BotError::validation(
                &signal.symbol,
                format!("invalid price {}", price),
            ));
        }

        // Check 1: one position per symbol
        if ledger.has_active(&signal.symbol) {
            return Ok(Admission::Rejected(RejectReason::SymbolAlreadyOpen));
        }

        // Check 2: concurrency cap
        if ledger.active_count() >= self.max_concurrent {
            return Ok(Admission::Rejected(RejectReason::MaxPositionsReached));
        }

        // Check 3: margin ceiling
        let budget = ledger.budget();
        let requested_margin = budget.total_margin * self.margin_per_trade.fraction();
        if budget.available < requested_margin || requested_margin <= 0.0 {
            return Ok(Admission::Rejected(RejectReason::MarginExceeded));
        }

        // Check 4: exchange minimums after lot rounding
        let raw_size = requested_margin * f64::from(self.leverage) / price;
        let size = round_down_to_step(raw_size, symbol.step_size).ok_or_else(|| {
            BotError::validation(&signal.symbol, format!("cannot round size {}", raw_size))
        })?;
        if size <= 0.0 || size < symbol.min_qty || size * price < symbol.min_notional {
            return Ok(Admission::Rejected(RejectReason::BelowMinNotional));
        }

        let margin = size * price / f64::from(self.leverage);
        let position_id = ledger.reserve(&signal.symbol, side, size, price, margin, now)?;

        Ok(Admission::Approved(OrderIntent {
            client_order_id: new_client_order_id(),
            symbol: signal.symbol.clone(),
            side: side.entry_order_side(),
            size,
            order_type: OrderType::Market,
            reduce_only: false,
            position_id,
            reference_price: price,
        }))
    }
}

/// Exchange-safe client order id (at most 36 characters)
pub fn new_client_order_id() -> String {
    format!("sb-{}", Uuid::new_v4().simple())
}

/// Round `value` down to a multiple of `step` in decimal arithmetic.
///
/// A non-positive step leaves the value unchanged.
pub fn round_down_to_step(value: f64, step: f64) -> Option<f64> {
    if step <= 0.0 {
        return Some(value);
    }
    let value = Decimal::try_from(value).ok()?;
    let step = Decimal::try_from(step).ok()?;
    ((value / step).floor() * step).normalize().to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::LedgerSettings;
    use crate::models::{IndicatorSnapshot, PositionStatus, SignalKind};

    fn ledger(total_margin: f64, ceiling: f64) -> PositionLedger {
        PositionLedger::new(LedgerSettings {
            total_margin,
            margin_ceiling: ceiling,
            take_profit_pct: 0.8,
            stop_loss_pct: 2.0,
            trading_fee_pct: 0.0,
            closed_history: 10,
            count_adopted_margin: true,
        })
    }

    fn symbol(name: &str) -> SymbolConfig {
        SymbolConfig {
            symbol: name.to_string(),
            leverage: 10,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    fn signal(name: &str, kind: SignalKind, price: f64) -> Signal {
        Signal {
            symbol: name.to_string(),
            kind,
            snapshot: IndicatorSnapshot {
                symbol: name.to_string(),
                price,
                rsi: 31.0,
                sma_short: 101.0,
                sma_long: 100.0,
                timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(30.0, 0.001), Some(30.0));
        assert_eq!(round_down_to_step(0.12345, 0.001), Some(0.123));
        assert_eq!(round_down_to_step(17.9, 1.0), Some(17.0));
        assert_eq!(round_down_to_step(2.5, 0.0), Some(2.5));
    }

    #[test]
    fn test_margin_ceiling_scenario() {
        // Ceiling 30% of 1000, 30% per trade, 10x at price 100
        let mut ledger = ledger(1000.0, 0.30);
        let risk = RiskManager::new(MarginFraction::Pct30, 10, 3);

        let first = risk
            .admit(
                &mut ledger,
                &signal("BTCUSDT", SignalKind::LongEntry, 100.0),
                &symbol("BTCUSDT"),
                Utc::now(),
            )
            .unwrap();
        let Admission::Approved(intent) = first else {
            panic!("expected approval");
        };
        assert_eq!(intent.size, 30.0);
        assert!(!intent.reduce_only);
        assert_eq!(ledger.committed_margin(), 300.0);
        assert_eq!(ledger.get("BTCUSDT").unwrap().status, PositionStatus::Pending);

        let second = risk
            .admit(
                &mut ledger,
                &signal("ETHUSDT", SignalKind::LongEntry, 100.0),
                &symbol("ETHUSDT"),
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(
            second,
            Admission::Rejected(RejectReason::MarginExceeded)
        ));
        assert_eq!(ledger.active_count(), 1);
    }

    #[test]
    fn test_symbol_already_open() {
        let mut ledger = ledger(1000.0, 0.75);
        let risk = RiskManager::new(MarginFraction::Pct10, 10, 3);
        let sig = signal("BTCUSDT", SignalKind::LongEntry, 100.0);

        risk.admit(&mut ledger, &sig, &symbol("BTCUSDT"), Utc::now())
            .unwrap();
        let short = signal("BTCUSDT", SignalKind::ShortEntry, 100.0);
        let again = risk
            .admit(&mut ledger, &short, &symbol("BTCUSDT"), Utc::now())
            .unwrap();

        assert!(matches!(
            again,
            Admission::Rejected(RejectReason::SymbolAlreadyOpen)
        ));
    }

    #[test]
    fn test_max_positions_reached() {
        let mut ledger = ledger(10_000.0, 1.0);
        let risk = RiskManager::new(MarginFraction::Pct10, 10, 3);

        for name in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            let admission = risk
                .admit(
                    &mut ledger,
                    &signal(name, SignalKind::LongEntry, 100.0),
                    &symbol(name),
                    Utc::now(),
                )
                .unwrap();
            assert!(matches!(admission, Admission::Approved(_)));
        }

        let fourth = risk
            .admit(
                &mut ledger,
                &signal("BNBUSDT", SignalKind::ShortEntry, 100.0),
                &symbol("BNBUSDT"),
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(
            fourth,
            Admission::Rejected(RejectReason::MaxPositionsReached)
        ));
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RejectReason::MarginExceeded.to_string(), "MARGIN_EXCEEDED");
        assert_eq!(
            RejectReason::MaxPositionsReached.to_string(),
            "MAX_POSITIONS_REACHED"
        );
    }

    #[test]
    fn test_below_min_notional() {
        let mut ledger = ledger(10.0, 1.0);
        let risk = RiskManager::new(MarginFraction::Pct10, 10, 3);
        // 1 margin * 10x = 10 notional at 60000 → 0.000166 rounds to 0
        let admission = risk
            .admit(
                &mut ledger,
                &signal("BTCUSDT", SignalKind::LongEntry, 60_000.0),
                &symbol("BTCUSDT"),
                Utc::now(),
            )
            .unwrap();

        assert!(matches!(
            admission,
            Admission::Rejected(RejectReason::BelowMinNotional)
        ));
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn test_short_entry_sells() {
        let mut ledger = ledger(1000.0, 0.75);
        let risk = RiskManager::new(MarginFraction::Pct20, 10, 3);

        let admission = risk
            .admit(
                &mut ledger,
                &signal("SOLUSDT", SignalKind::ShortEntry, 150.0),
                &SymbolConfig {
                    step_size: 0.01,
                    ..symbol("SOLUSDT")
                },
                Utc::now(),
            )
            .unwrap();

        let Admission::Approved(intent) = admission else {
            panic!("expected approval");
        };
        assert_eq!(intent.side, crate::models::OrderSide::Sell);
        // 200 * 10 / 150 = 13.333.. → 13.33
        assert_eq!(intent.size, 13.33);
        assert!(intent.client_order_id.len() <= 36);
    }

    #[test]
    fn test_invalid_inputs_are_validation_errors() {
        let mut ledger = ledger(1000.0, 0.75);
        let risk = RiskManager::new(MarginFraction::Pct10, 10, 3);

        for (kind, price) in [
            (SignalKind::LongEntry, 0.0),
            (SignalKind::LongEntry, f64::NAN),
            (SignalKind::Hold, 100.0),
        ] {
            let err = risk
                .admit(
                    &mut ledger,
                    &signal("BTCUSDT", kind, price),
                    &symbol("BTCUSDT"),
                    Utc::now(),
                )
                .unwrap_err();
            assert!(matches!(err, BotError::Validation { .. }));
        }
        assert_eq!(ledger.active_count(), 0);
    }
}
