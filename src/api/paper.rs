use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::ExchangeClient;
use crate::error::BotError;
use crate::models::{
    Candle, ExchangePosition, FillResult, FillStatus, OrderIntent, OrderSide,
};
use crate::Result;

/// In-memory exchange that fills market orders at the last known price.
///
/// Used for dry runs (optionally fed by a live market data source) and as a
/// scriptable counterparty in tests.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    market_data: Option<Arc<dyn ExchangeClient>>,
    order_latency: Option<Duration>,
    next_order_id: AtomicU64,
}

struct PaperState {
    balance: f64,
    candles: HashMap<String, Vec<Candle>>,
    positions: HashMap<String, ExchangePosition>,
    fills: HashMap<String, FillResult>,
    fill_ratio: f64,
    order_failures: VecDeque<BotError>,
    position_failures: VecDeque<BotError>,
    kline_failures: HashMap<String, usize>,
    orders: Vec<OrderIntent>,
    order_attempts: usize,
    cancels: Vec<String>,
}

impl PaperExchange {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance,
                candles: HashMap::new(),
                positions: HashMap::new(),
                fills: HashMap::new(),
                fill_ratio: 1.0,
                order_failures: VecDeque::new(),
                position_failures: VecDeque::new(),
                kline_failures: HashMap::new(),
                orders: Vec::new(),
                order_attempts: 0,
                cancels: Vec::new(),
            }),
            market_data: None,
            order_latency: None,
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Serve klines from another client instead of local candles
    pub fn with_market_data(mut self, source: Arc<dyn ExchangeClient>) -> Self {
        self.market_data = Some(source);
        self
    }

    /// Delay every order submission
    pub fn with_order_latency(mut self, latency: Duration) -> Self {
        self.order_latency = Some(latency);
        self
    }

    /// Append one candle per close, one minute apart
    pub fn push_candles(&self, symbol: &str, closes: &[f64]) {
        let mut state = self.lock();
        let candles = state.candles.entry(symbol.to_string()).or_default();
        let mut open_time = candles
            .last()
            .map(|c| c.open_time + ChronoDuration::minutes(1))
            .unwrap_or_else(|| Utc::now() - ChronoDuration::minutes(closes.len() as i64));

        for &close in closes {
            candles.push(Candle {
                symbol: symbol.to_string(),
                open_time,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            });
            open_time += ChronoDuration::minutes(1);
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.push_candles(symbol, &[price]);
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.lock()
            .candles
            .get(symbol)
            .and_then(|c| c.last())
            .map(|c| c.close)
    }

    /// Position opened or changed outside the bot. Signed size.
    pub fn open_external(&self, symbol: &str, size: f64, entry_price: f64) {
        self.lock().positions.insert(
            symbol.to_string(),
            ExchangePosition {
                symbol: symbol.to_string(),
                size,
                entry_price,
            },
        );
    }

    /// Position closed outside the bot (liquidation, manual close)
    pub fn close_external(&self, symbol: &str) {
        self.lock().positions.remove(symbol);
    }

    pub fn position(&self, symbol: &str) -> Option<ExchangePosition> {
        self.lock().positions.get(symbol).cloned()
    }

    /// Fraction of each order that fills (1.0 = full fills)
    pub fn set_fill_ratio(&self, ratio: f64) {
        self.lock().fill_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Fail the next order submission with `err`
    pub fn fail_next_order(&self, err: BotError) {
        self.lock().order_failures.push_back(err);
    }

    /// Fail the next position query with `err`
    pub fn fail_next_position_query(&self, err: BotError) {
        self.lock().position_failures.push_back(err);
    }

    /// Fail the next `count` kline requests for `symbol` with a transport error
    pub fn fail_next_klines(&self, symbol: &str, count: usize) {
        self.lock()
            .kline_failures
            .insert(symbol.to_string(), count);
    }

    /// Orders that reached the book
    pub fn orders(&self) -> Vec<OrderIntent> {
        self.lock().orders.clone()
    }

    /// Every submission, including failed ones
    pub fn order_attempts(&self) -> usize {
        self.lock().order_attempts
    }

    /// Client order ids that were cancelled
    pub fn cancels(&self) -> Vec<String> {
        self.lock().cancels.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PaperState {
    fn execute(&mut self, intent: &OrderIntent, order_id: u64) -> Result<FillResult> {
        let price = self
            .candles
            .get(&intent.symbol)
            .and_then(|c| c.last())
            .map(|c| c.close)
            .unwrap_or(intent.reference_price);
        if price.is_nan() || price <= 0.0 {
            return Err(BotError::rejection(-1013, "no price available"));
        }

        let signed_delta = match intent.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };

        let held = self
            .positions
            .get(&intent.symbol)
            .map(|p| p.size)
            .unwrap_or(0.0);

        let mut filled = intent.size * self.fill_ratio;
        if intent.reduce_only {
            // Must shrink an existing position in the opposite direction
            if held == 0.0 || held.signum() == signed_delta {
                return Err(BotError::rejection(-2022, "ReduceOnly Order is rejected."));
            }
            filled = filled.min(held.abs());
        }
        if filled <= 0.0 {
            return Err(BotError::rejection(-2010, "order would not fill"));
        }

        let new_size = held + signed_delta * filled;
        if new_size.abs() < 1e-12 {
            if let Some(closed) = self.positions.remove(&intent.symbol) {
                self.balance += (price - closed.entry_price) * closed.size;
            }
        } else {
            let entry = self.positions.entry(intent.symbol.clone()).or_insert(ExchangePosition {
                symbol: intent.symbol.clone(),
                size: 0.0,
                entry_price: price,
            });
            if intent.reduce_only {
                self.balance += (price - entry.entry_price) * (entry.size - new_size);
            } else if entry.size != 0.0 {
                let total = entry.size.abs() + filled;
                entry.entry_price = (entry.entry_price * entry.size.abs() + price * filled) / total;
            }
            entry.size = new_size;
        }

        Ok(FillResult {
            order_id: order_id.to_string(),
            filled_size: filled,
            avg_price: price,
            status: if filled < intent.size {
                FillStatus::PartiallyFilled
            } else {
                FillStatus::Filled
            },
        })
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        {
            let mut state = self.lock();
            if let Some(remaining) = state.kline_failures.get_mut(symbol) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BotError::Transport(format!("klines for {} unavailable", symbol)));
                }
            }
        }

        if let Some(source) = &self.market_data {
            let candles = source.klines(symbol, interval, limit).await?;
            if let Some(last) = candles.last() {
                // Paper fills track the live price
                let mut state = self.lock();
                let local = state.candles.entry(symbol.to_string()).or_default();
                local.clear();
                local.push(last.clone());
            }
            return Ok(candles);
        }

        let state = self.lock();
        let candles = state.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<FillResult> {
        if let Some(latency) = self.order_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.order_attempts += 1;

        if let Some(err) = state.order_failures.pop_front() {
            return Err(err);
        }

        // Same client order id means a retry of an order we already filled
        if let Some(fill) = state.fills.get(&intent.client_order_id) {
            return Ok(fill.clone());
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let fill = state.execute(intent, order_id)?;
        state.orders.push(intent.clone());
        state
            .fills
            .insert(intent.client_order_id.clone(), fill.clone());

        tracing::debug!(
            symbol = %intent.symbol,
            side = intent.side.as_str(),
            size = fill.filled_size,
            price = fill.avg_price,
            "paper fill"
        );

        Ok(fill)
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> Result<()> {
        self.lock().cancels.push(client_order_id.to_string());
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>> {
        let mut state = self.lock();
        if let Some(err) = state.position_failures.pop_front() {
            return Err(err);
        }
        let mut positions: Vec<ExchangePosition> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn account_balance(&self) -> Result<f64> {
        Ok(self.lock().balance)
    }
}
