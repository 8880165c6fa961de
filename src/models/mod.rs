use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a futures position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// Order side as understood by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
        }
    }
}

/// Per-symbol trading parameters, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolConfig {
    pub symbol: String,
    pub leverage: u32,
    /// Lot step; order sizes are rounded down to a multiple of this
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

/// One OHLCV bar as returned by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Indicator state for one symbol at one point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub price: f64,
    pub rsi: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    pub timestamp: DateTime<Utc>,
}

/// Why an open position is being (or was) closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    MaxHoldTime,
    /// Position disappeared from the exchange without our close order
    External,
    Shutdown,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    LongEntry,
    ShortEntry,
    Exit(ExitReason),
    Hold,
}

impl SignalKind {
    /// Position side an entry signal asks for
    pub fn entry_side(self) -> Option<Side> {
        match self {
            SignalKind::LongEntry => Some(Side::Long),
            SignalKind::ShortEntry => Some(Side::Short),
            _ => None,
        }
    }
}

/// Trading signal; consumed within the cycle that produced it
#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    pub snapshot: IndicatorSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closing,
    Closed,
}

/// Position in one symbol, owned by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub margin: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    /// Opened outside the bot and adopted during reconciliation
    pub external: bool,
    pub order_id: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }
}

/// Order to submit; lives only for the duration of the submission attempt
#[derive(Debug, Clone, Serialize)]
pub struct OrderIntent {
    /// Client order id, reused across retries so the exchange can dedupe
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub order_type: OrderType,
    pub reduce_only: bool,
    /// Ledger position this order opens or closes
    pub position_id: Uuid,
    /// Price the decision was made at
    pub reference_price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
}

/// Confirmed execution reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: String,
    pub filled_size: f64,
    pub avg_price: f64,
    pub status: FillStatus,
}

/// Position as reported by the exchange (ground truth)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed size: positive long, negative short
    pub size: f64,
    pub entry_price: f64,
}

impl ExchangePosition {
    pub fn side(&self) -> Side {
        if self.size < 0.0 {
            Side::Short
        } else {
            Side::Long
        }
    }

    pub fn abs_size(&self) -> f64 {
        self.size.abs()
    }
}
