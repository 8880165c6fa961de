use super::Strategy;
use crate::config::StrategyParams;
use crate::models::{IndicatorSnapshot, SignalKind};

/// RSI threshold crossover confirmed by the moving-average trend
///
/// - Long: RSI crosses up through the oversold line while the short SMA is
///   above the long SMA
/// - Short: RSI crosses down through the overbought line while the short SMA
///   is below the long SMA
///
/// A cross needs the prior snapshot on the other side of the line, so the
/// first snapshot of a symbol always holds.
///
/// # Example
/// ```
/// use chrono::Utc;
/// use scalpbot::config::StrategyParams;
/// use scalpbot::strategy::{RsiCrossover, Strategy};
/// use scalpbot::{IndicatorSnapshot, SignalKind};
///
/// let snapshot = |rsi: f64| IndicatorSnapshot {
///     symbol: "BTCUSDT".to_string(),
///     price: 100.0,
///     rsi,
///     sma_short: 101.0,
///     sma_long: 100.0,
///     timestamp: Utc::now(),
/// };
///
/// let strategy = RsiCrossover::new(StrategyParams::default());
/// let signal = strategy.entry_signal(&snapshot(32.0), Some(&snapshot(28.0)));
/// assert_eq!(signal, SignalKind::LongEntry);
/// ```
#[derive(Debug, Clone)]
pub struct RsiCrossover {
    params: StrategyParams,
}

impl RsiCrossover {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    fn crossed_up(&self, current: &IndicatorSnapshot, prior: &IndicatorSnapshot) -> bool {
        let line = self.params.rsi_oversold;
        prior.rsi < line && current.rsi >= line && current.sma_short > current.sma_long
    }

    fn crossed_down(&self, current: &IndicatorSnapshot, prior: &IndicatorSnapshot) -> bool {
        let line = self.params.rsi_overbought;
        prior.rsi > line && current.rsi <= line && current.sma_short < current.sma_long
    }
}

impl Default for RsiCrossover {
    fn default() -> Self {
        Self::new(StrategyParams::default())
    }
}

impl Strategy for RsiCrossover {
    fn entry_signal(
        &self,
        current: &IndicatorSnapshot,
        prior: Option<&IndicatorSnapshot>,
    ) -> SignalKind {
        let Some(prior) = prior else {
            return SignalKind::Hold;
        };

        match (self.crossed_up(current, prior), self.crossed_down(current, prior)) {
            (true, false) => SignalKind::LongEntry,
            (false, true) => SignalKind::ShortEntry,
            // Both or neither
            _ => SignalKind::Hold,
        }
    }

    fn name(&self) -> &str {
        "RSI Crossover"
    }
}
