// Market data: klines in, indicator snapshots out
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::ExchangeClient;
use crate::config::StrategyParams;
use crate::error::BotError;
use crate::indicators::{calculate_rsi, calculate_sma};
use crate::models::{Candle, IndicatorSnapshot};
use crate::Result;

/// Latest snapshot plus the one before it, for crossover detection
#[derive(Debug, Clone)]
struct SnapshotPair {
    prior: Option<IndicatorSnapshot>,
    latest: IndicatorSnapshot,
}

/// Normalizes exchange klines into per-symbol indicator snapshots
pub struct MarketDataAdapter {
    exchange: Arc<dyn ExchangeClient>,
    params: StrategyParams,
    interval: String,
    limit: usize,
    timeout: Duration,
    snapshots: Mutex<HashMap<String, SnapshotPair>>,
}

impl MarketDataAdapter {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        params: StrategyParams,
        interval: impl Into<String>,
        limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            params,
            interval: interval.into(),
            limit,
            timeout,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch candles and compute a fresh snapshot for `symbol`.
    ///
    /// The previous snapshot becomes the prior; anything older is dropped.
    pub async fn get_indicators(&self, symbol: &str) -> Result<IndicatorSnapshot> {
        let fetch = self.exchange.klines(symbol, &self.interval, self.limit);
        let candles = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| {
                BotError::Transport(format!(
                    "klines for {} timed out after {:?}",
                    symbol, self.timeout
                ))
            })??;

        let snapshot = compute_snapshot(symbol, &candles, &self.params)?;

        let mut snapshots = self.lock();
        let prior = snapshots.remove(symbol).map(|pair| pair.latest);
        snapshots.insert(
            symbol.to_string(),
            SnapshotPair {
                prior,
                latest: snapshot.clone(),
            },
        );

        Ok(snapshot)
    }

    /// Refresh every symbol; failures are returned per symbol, not fatal
    pub async fn poll(&self, symbols: &[String]) -> Vec<(String, Result<IndicatorSnapshot>)> {
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            results.push((symbol.clone(), self.get_indicators(symbol).await));
        }
        results
    }

    pub fn latest(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.lock().get(symbol).map(|pair| pair.latest.clone())
    }

    pub fn prior(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.lock().get(symbol).and_then(|pair| pair.prior.clone())
    }

    pub fn latest_snapshots(&self) -> HashMap<String, IndicatorSnapshot> {
        self.lock()
            .iter()
            .map(|(symbol, pair)| (symbol.clone(), pair.latest.clone()))
            .collect()
    }

    pub fn latest_prices(&self) -> HashMap<String, f64> {
        self.lock()
            .iter()
            .map(|(symbol, pair)| (symbol.clone(), pair.latest.price))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SnapshotPair>> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Indicator snapshot from candles ordered oldest first
pub fn compute_snapshot(
    symbol: &str,
    candles: &[Candle],
    params: &StrategyParams,
) -> Result<IndicatorSnapshot> {
    let needed = params.min_candles();
    if candles.len() < needed {
        return Err(BotError::validation(
            symbol,
            format!("insufficient history: {} of {} candles", candles.len(), needed),
        ));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let price = closes.last().copied().unwrap_or_default();
    if !price.is_finite() || price <= 0.0 {
        return Err(BotError::validation(symbol, format!("invalid price {}", price)));
    }

    let missing = |name: &str| BotError::validation(symbol, format!("{} unavailable", name));
    let rsi = calculate_rsi(&closes, params.rsi_period).ok_or_else(|| missing("RSI"))?;
    let sma_short = calculate_sma(&closes, params.sma_short).ok_or_else(|| missing("short SMA"))?;
    let sma_long = calculate_sma(&closes, params.sma_long).ok_or_else(|| missing("long SMA"))?;

    Ok(IndicatorSnapshot {
        symbol: symbol.to_string(),
        price,
        rsi,
        sma_short,
        sma_long,
        timestamp: Utc::now(),
    })
}
