pub mod asterdex;
pub mod paper;

pub use asterdex::AsterDexClient;
pub use paper::PaperExchange;

use async_trait::async_trait;

use crate::models::{Candle, ExchangePosition, FillResult, OrderIntent};
use crate::Result;

/// Exchange surface the trading core depends on.
///
/// Implementations map their failures onto [`crate::BotError`]: network
/// problems and timeouts are `Transport`, explicit refusals are
/// `ExchangeRejection`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Most recent `limit` bars, oldest first
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Submit a market order and wait for its fill
    async fn place_order(&self, intent: &OrderIntent) -> Result<FillResult>;

    /// Cancel an order by its client order id
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<()>;

    /// Non-zero positions currently held on the account
    async fn list_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Quote-currency margin available to the account
    async fn account_balance(&self) -> Result<f64>;

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }
}
