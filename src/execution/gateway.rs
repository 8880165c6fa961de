use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::ExchangeClient;
use crate::execution::ledger::{lock_ledger, SharedLedger};
use crate::execution::retry::{with_retry, RetryPolicy};
use crate::models::{ExitReason, FillResult, OrderIntent, OrderType, Position};
use crate::risk::admission::new_client_order_id;
use crate::status::{EventLog, TradeRecord};
use crate::Result;

/// Submits orders and applies their confirmed outcome to the ledger
pub struct ExecutionGateway {
    exchange: Arc<dyn ExchangeClient>,
    ledger: SharedLedger,
    events: EventLog,
    policy: RetryPolicy,
}

impl ExecutionGateway {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: SharedLedger,
        events: EventLog,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            exchange,
            ledger,
            events,
            policy,
        }
    }

    /// Submit an approved entry and move its reservation to OPEN.
    ///
    /// Any failure releases the reservation. A submission whose outcome is
    /// unknown (transport failure) is also cancelled best-effort.
    pub async fn open(&self, intent: &OrderIntent) -> Result<Position> {
        let label = format!("{} {} entry", intent.symbol, intent.side.as_str());

        match self.submit(intent, &label).await {
            Ok(fill) => {
                let confirmed = lock_ledger(&self.ledger).confirm_open(
                    &intent.symbol,
                    intent.position_id,
                    &fill,
                );
                match confirmed {
                    Ok(position) => {
                        self.events.success(
                            Some(&position.symbol),
                            format!(
                                "Opened {:?} {} @ {:.4} (TP {:.4}, SL {:.4}, margin {:.2}){}",
                                position.side,
                                position.size,
                                position.entry_price,
                                position.take_profit,
                                position.stop_loss,
                                position.margin,
                                if fill.filled_size < intent.size {
                                    " partial fill"
                                } else {
                                    ""
                                }
                            ),
                        );
                        Ok(position)
                    }
                    Err(e) => {
                        // Filled on the exchange without a reservation; reconciliation adopts it
                        self.events.error(
                            Some(&intent.symbol),
                            format!("fill {} could not be recorded: {}", fill.order_id, e),
                        );
                        Err(e)
                    }
                }
            }
            Err(e) => {
                lock_ledger(&self.ledger).release(&intent.symbol, intent.position_id);
                if e.is_retryable() {
                    self.cancel_uncertain(intent).await;
                }
                self.events.error(
                    Some(&intent.symbol),
                    format!("Entry failed, reservation released: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Close the open position in `symbol` with a reduce-only market order.
    ///
    /// Returns `Ok(None)` when there is nothing to close, another close is
    /// already in flight, or only part of the position was filled. On failure
    /// the position reverts to OPEN for a later cycle.
    pub async fn close(
        &self,
        symbol: &str,
        reason: ExitReason,
        price: f64,
    ) -> Result<Option<TradeRecord>> {
        let Some(position) = lock_ledger(&self.ledger).begin_close(symbol, reason) else {
            return Ok(None);
        };

        let intent = OrderIntent {
            client_order_id: new_client_order_id(),
            symbol: symbol.to_string(),
            side: position.side.exit_order_side(),
            size: position.size,
            order_type: OrderType::Market,
            reduce_only: true,
            position_id: position.id,
            reference_price: price,
        };
        let label = format!("{} {:?} exit", symbol, reason);

        match self.submit(&intent, &label).await {
            Ok(fill) if fill.filled_size + f64::EPSILON < position.size => {
                let remaining = position.size - fill.filled_size;
                let mut ledger = lock_ledger(&self.ledger);
                ledger.adjust_size(symbol, remaining)?;
                ledger.abort_close(symbol, position.id);
                drop(ledger);

                self.events.warning(
                    Some(symbol),
                    format!(
                        "Exit partially filled ({} of {}), {} left open",
                        fill.filled_size, position.size, remaining
                    ),
                );
                Ok(None)
            }
            Ok(fill) => {
                let trade = lock_ledger(&self.ledger).confirm_closed(
                    symbol,
                    position.id,
                    fill.avg_price,
                    Utc::now(),
                )?;
                self.events.success(
                    Some(symbol),
                    format!(
                        "Closed {:?} @ {:.4} ({:?}) P&L {:+.4}",
                        trade.side, trade.exit_price, trade.reason, trade.pnl
                    ),
                );
                Ok(Some(trade))
            }
            Err(e) => {
                lock_ledger(&self.ledger).abort_close(symbol, position.id);
                if e.is_retryable() {
                    self.cancel_uncertain(&intent).await;
                }
                self.events
                    .error(Some(symbol), format!("Exit failed, position kept open: {}", e));
                Err(e)
            }
        }
    }

    /// Close every open position, returning the trades that completed
    pub async fn close_all(
        &self,
        reason: ExitReason,
        prices: &HashMap<String, f64>,
    ) -> Vec<TradeRecord> {
        let targets: Vec<(String, f64)> = lock_ledger(&self.ledger)
            .open_positions()
            .into_iter()
            .map(|p| {
                let price = prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                (p.symbol.clone(), price)
            })
            .collect();

        let mut trades = Vec::new();
        for (symbol, price) in targets {
            match self.close(&symbol, reason, price).await {
                Ok(Some(trade)) => trades.push(trade),
                Ok(None) => {}
                Err(e) => tracing::debug!(symbol = %symbol, "close_all: {}", e),
            }
        }
        trades
    }

    /// Cancel an order by client order id
    pub async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        self.exchange.cancel_order(symbol, client_order_id).await
    }

    async fn submit(&self, intent: &OrderIntent, label: &str) -> Result<FillResult> {
        let exchange = &self.exchange;
        with_retry(&self.policy, label, move || exchange.place_order(intent)).await
    }

    async fn cancel_uncertain(&self, intent: &OrderIntent) {
        if let Err(e) = self
            .cancel_order(&intent.symbol, &intent.client_order_id)
            .await
        {
            tracing::debug!(
                symbol = %intent.symbol,
                client_order_id = %intent.client_order_id,
                "cancel after failed submission: {}",
                e
            );
        }
    }
}
