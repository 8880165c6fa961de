// Trading strategy module
pub mod rsi_crossover;
pub mod signals;

pub use rsi_crossover::RsiCrossover;
pub use signals::{check_exit, SignalGenerator};

use crate::models::{IndicatorSnapshot, SignalKind};

/// Entry logic over indicator snapshots
pub trait Strategy: Send + Sync {
    /// LongEntry, ShortEntry or Hold. Exits are not the strategy's concern.
    fn entry_signal(
        &self,
        current: &IndicatorSnapshot,
        prior: Option<&IndicatorSnapshot>,
    ) -> SignalKind;

    /// Get strategy name
    fn name(&self) -> &str;
}
