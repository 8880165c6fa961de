// Ledger vs exchange reconciliation
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::ExchangeClient;
use crate::error::BotError;
use crate::execution::ledger::{lock_ledger, PositionLedger, SharedLedger};
use crate::models::{ExchangePosition, PositionStatus, Side};
use crate::status::EventLog;
use crate::Result;

/// Relative size difference below which ledger and exchange agree
const SIZE_TOLERANCE: f64 = 1e-9;

/// One fix applied to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Exchange holds a position the ledger does not know
    Adopt {
        symbol: String,
        side: Side,
        size: f64,
        entry_price: f64,
    },
    /// Ledger position no longer exists on the exchange
    CloseExternal { symbol: String },
    Resize { symbol: String, from: f64, to: f64 },
    /// Exchange holds the opposite side: close ours, adopt theirs
    Replace {
        symbol: String,
        side: Side,
        size: f64,
        entry_price: f64,
    },
}

impl Correction {
    pub fn symbol(&self) -> &str {
        match self {
            Correction::Adopt { symbol, .. }
            | Correction::CloseExternal { symbol }
            | Correction::Resize { symbol, .. }
            | Correction::Replace { symbol, .. } => symbol,
        }
    }

    fn describe(&self) -> String {
        match self {
            Correction::Adopt {
                side,
                size,
                entry_price,
                ..
            } => format!(
                "untracked {:?} {} @ {} on exchange, adopted",
                side, size, entry_price
            ),
            Correction::CloseExternal { .. } => {
                "position gone from exchange, marked closed".to_string()
            }
            Correction::Resize { from, to, .. } => {
                format!("size {} on ledger vs {} on exchange, resized", from, to)
            }
            Correction::Replace { side, size, .. } => format!(
                "exchange holds {:?} {}, replaced ledger position",
                side, size
            ),
        }
    }

    pub fn as_drift(&self) -> BotError {
        BotError::ReconciliationDrift {
            symbol: self.symbol().to_string(),
            detail: self.describe(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub corrections: Vec<Correction>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty()
    }
}

/// Diff the ledger against exchange positions for the configured symbols.
///
/// Symbols with a PENDING reservation are left alone.
pub fn plan(
    ledger: &PositionLedger,
    remote: &[ExchangePosition],
    symbols: &[String],
) -> Vec<Correction> {
    let remote: HashMap<&str, &ExchangePosition> = remote
        .iter()
        .filter(|p| p.size != 0.0)
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    let mut corrections = Vec::new();
    for symbol in symbols {
        let local = ledger.get(symbol);
        let exchange = remote.get(symbol.as_str());

        match (local, exchange) {
            (Some(local), _) if local.status == PositionStatus::Pending => {}
            (None, None) => {}
            (None, Some(exchange)) => corrections.push(Correction::Adopt {
                symbol: symbol.clone(),
                side: exchange.side(),
                size: exchange.abs_size(),
                entry_price: exchange.entry_price,
            }),
            (Some(_), None) => corrections.push(Correction::CloseExternal {
                symbol: symbol.clone(),
            }),
            (Some(local), Some(exchange)) => {
                if local.side != exchange.side() {
                    corrections.push(Correction::Replace {
                        symbol: symbol.clone(),
                        side: exchange.side(),
                        size: exchange.abs_size(),
                        entry_price: exchange.entry_price,
                    });
                } else if (local.size - exchange.abs_size()).abs()
                    > SIZE_TOLERANCE * exchange.abs_size().max(1.0)
                {
                    corrections.push(Correction::Resize {
                        symbol: symbol.clone(),
                        from: local.size,
                        to: exchange.abs_size(),
                    });
                }
            }
        }
    }
    corrections
}

/// Periodically aligns the ledger with exchange-reported positions
pub struct Reconciler {
    exchange: Arc<dyn ExchangeClient>,
    ledger: SharedLedger,
    events: EventLog,
    symbols: Vec<String>,
    leverage: u32,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: SharedLedger,
        events: EventLog,
        symbols: Vec<String>,
        leverage: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            ledger,
            events,
            symbols,
            leverage,
            timeout,
        }
    }

    /// Fetch exchange positions and correct every divergence.
    ///
    /// `prices` supplies exit prices for positions closed outside the bot.
    pub async fn reconcile(&self, prices: &HashMap<String, f64>) -> Result<ReconcileReport> {
        let remote = tokio::time::timeout(self.timeout, self.exchange.list_positions())
            .await
            .map_err(|_| {
                BotError::Transport(format!("position query timed out after {:?}", self.timeout))
            })??;

        let applied = {
            let mut ledger = lock_ledger(&self.ledger);
            let corrections = plan(&ledger, &remote, &self.symbols);
            corrections
                .into_iter()
                .map(|correction| {
                    let outcome = self.apply(&mut ledger, &correction, prices);
                    (correction, outcome)
                })
                .collect::<Vec<_>>()
        };

        let mut report = ReconcileReport::default();
        for (correction, outcome) in applied {
            match outcome {
                Ok(()) => {
                    self.events
                        .warning(Some(correction.symbol()), correction.as_drift().to_string());
                    report.corrections.push(correction);
                }
                Err(e) => self.events.error(
                    Some(correction.symbol()),
                    format!("reconciliation fix failed: {}", e),
                ),
            }
        }

        if report.is_clean() {
            tracing::debug!(symbols = self.symbols.len(), "ledger matches exchange");
        }
        Ok(report)
    }

    fn apply(
        &self,
        ledger: &mut PositionLedger,
        correction: &Correction,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        let now = Utc::now();
        match correction {
            Correction::Adopt {
                symbol,
                side,
                size,
                entry_price,
            } => {
                let margin = size * entry_price / f64::from(self.leverage);
                ledger.adopt(symbol, *side, *size, *entry_price, margin, now)?;
            }
            Correction::CloseExternal { symbol } => {
                let exit_price = self.exit_price(ledger, symbol, prices);
                ledger.close_external(symbol, exit_price, now)?;
            }
            Correction::Resize { symbol, to, .. } => {
                ledger.adjust_size(symbol, *to)?;
            }
            Correction::Replace {
                symbol,
                side,
                size,
                entry_price,
            } => {
                let exit_price = self.exit_price(ledger, symbol, prices);
                ledger.close_external(symbol, exit_price, now)?;
                let margin = size * entry_price / f64::from(self.leverage);
                ledger.adopt(symbol, *side, *size, *entry_price, margin, now)?;
            }
        }
        Ok(())
    }

    fn exit_price(
        &self,
        ledger: &PositionLedger,
        symbol: &str,
        prices: &HashMap<String, f64>,
    ) -> f64 {
        prices
            .get(symbol)
            .copied()
            .or_else(|| ledger.get(symbol).map(|p| p.entry_price))
            .unwrap_or_default()
    }
}
