// Technical indicators used by the scalping signal: RSI and simple moving averages

pub mod moving_average;
pub mod rsi;

pub use moving_average::calculate_sma;
pub use rsi::calculate_rsi;
