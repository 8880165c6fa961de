//! Layered configuration: defaults, optional TOML file, `SCALPBOT__*` env vars.
//!
//! Everything is validated once into [`BotConfig`], which stays immutable for
//! the lifetime of a run.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::models::SymbolConfig;
use crate::Result;

pub const DEFAULT_BASE_URL: &str = "https://fapi.asterdex.com";
pub const FIXED_LEVERAGE: u32 = 10;
pub const MAX_CONCURRENT_POSITIONS: usize = 3;

const ENV_API_KEY: &str = "ASTERDEX_API_KEY";
const ENV_API_SECRET: &str = "ASTERDEX_API_SECRET";

/// Fraction of total margin committed per trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarginFraction {
    Pct10,
    Pct20,
    Pct30,
    Pct40,
    Pct50,
}

impl MarginFraction {
    pub fn percent(self) -> u32 {
        match self {
            MarginFraction::Pct10 => 10,
            MarginFraction::Pct20 => 20,
            MarginFraction::Pct30 => 30,
            MarginFraction::Pct40 => 40,
            MarginFraction::Pct50 => 50,
        }
    }

    pub fn fraction(self) -> f64 {
        f64::from(self.percent()) / 100.0
    }
}

impl TryFrom<u32> for MarginFraction {
    type Error = BotError;

    fn try_from(pct: u32) -> Result<Self> {
        match pct {
            10 => Ok(MarginFraction::Pct10),
            20 => Ok(MarginFraction::Pct20),
            30 => Ok(MarginFraction::Pct30),
            40 => Ok(MarginFraction::Pct40),
            50 => Ok(MarginFraction::Pct50),
            other => Err(BotError::Configuration(format!(
                "margin_per_trade_pct must be one of 10, 20, 30, 40, 50 (got {})",
                other
            ))),
        }
    }
}

/// API credentials. Opaque to the core and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Signal thresholds and indicator periods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub rsi_period: usize,
    pub sma_short: usize,
    pub sma_long: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            sma_short: 5,
            sma_long: 10,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

impl StrategyParams {
    /// Number of closes needed before every indicator is defined
    pub fn min_candles(&self) -> usize {
        (self.rsi_period + 1).max(self.sma_long)
    }
}

/// A symbol entry: either a bare name or a table with explicit precision
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSymbol {
    Name(String),
    Detailed {
        symbol: String,
        step_size: Option<f64>,
        min_qty: Option<f64>,
        min_notional: Option<f64>,
    },
}

/// Unvalidated configuration as deserialized from the layered sources
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub symbols: Vec<RawSymbol>,
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub dry_run: bool,
    pub paper_balance: f64,
    /// Overrides the account balance fetched at start
    pub total_margin: Option<f64>,
    pub leverage: u32,
    pub margin_per_trade_pct: u32,
    pub margin_ceiling_pct: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trading_fee_pct: f64,
    pub cycle_interval_secs: f64,
    pub reconcile_every_cycles: u64,
    pub pending_timeout_secs: u64,
    pub max_hold_secs: u64,
    pub kline_interval: String,
    pub kline_limit: usize,
    pub request_timeout_ms: u64,
    pub max_order_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub event_log_capacity: usize,
    pub closed_history: usize,
    pub close_positions_on_shutdown: bool,
    pub adopted_positions_count_against_ceiling: bool,
    pub strategy: StrategyParams,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_secret: None,
            dry_run: false,
            paper_balance: 1000.0,
            total_margin: None,
            leverage: FIXED_LEVERAGE,
            margin_per_trade_pct: 20,
            margin_ceiling_pct: 75.0,
            take_profit_pct: 0.8,
            stop_loss_pct: 2.0,
            trading_fee_pct: 0.035,
            cycle_interval_secs: 5.0,
            reconcile_every_cycles: 6,
            pending_timeout_secs: 30,
            max_hold_secs: 300,
            kline_interval: "1m".to_string(),
            kline_limit: 100,
            request_timeout_ms: 5_000,
            max_order_attempts: 3,
            retry_base_delay_ms: 250,
            event_log_capacity: 200,
            closed_history: 100,
            close_positions_on_shutdown: true,
            adopted_positions_count_against_ceiling: true,
            strategy: StrategyParams::default(),
        }
    }
}

/// Validated, immutable run configuration
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub symbols: Vec<SymbolConfig>,
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub dry_run: bool,
    pub paper_balance: f64,
    pub total_margin: Option<f64>,
    pub leverage: u32,
    pub margin_per_trade: MarginFraction,
    /// Fraction of total margin that may be committed at once
    pub margin_ceiling: f64,
    pub max_concurrent_positions: usize,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trading_fee_pct: f64,
    pub cycle_interval: Duration,
    pub reconcile_every_cycles: u64,
    pub pending_timeout: Duration,
    pub max_hold: Option<Duration>,
    pub kline_interval: String,
    pub kline_limit: usize,
    pub request_timeout: Duration,
    pub max_order_attempts: u32,
    pub retry_base_delay: Duration,
    pub event_log_capacity: usize,
    pub closed_history: usize,
    pub close_positions_on_shutdown: bool,
    pub adopted_positions_count_against_ceiling: bool,
    pub strategy: StrategyParams,
}

impl BotConfig {
    /// Load from an optional TOML file, then `SCALPBOT__*` environment variables.
    ///
    /// Credentials come from `ASTERDEX_API_KEY` / `ASTERDEX_API_SECRET` when set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("SCALPBOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()?;

        let mut raw: RawConfig = settings.try_deserialize()?;
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            raw.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var(ENV_API_SECRET) {
            raw.api_secret = Some(secret);
        }

        Self::from_raw(raw)
    }

    /// Validate raw settings
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.symbols.is_empty() {
            return Err(BotError::Configuration(
                "at least one symbol must be configured".into(),
            ));
        }
        if raw.leverage != FIXED_LEVERAGE {
            return Err(BotError::Configuration(format!(
                "leverage is fixed at {}x (got {}x)",
                FIXED_LEVERAGE, raw.leverage
            )));
        }

        let mut symbols: Vec<SymbolConfig> = Vec::with_capacity(raw.symbols.len());
        for entry in &raw.symbols {
            let symbol = resolve_symbol(entry, raw.leverage)?;
            if symbols.iter().any(|s| s.symbol == symbol.symbol) {
                return Err(BotError::Configuration(format!(
                    "symbol {} listed twice",
                    symbol.symbol
                )));
            }
            symbols.push(symbol);
        }

        let margin_per_trade = MarginFraction::try_from(raw.margin_per_trade_pct)?;

        if !(raw.margin_ceiling_pct > 0.0 && raw.margin_ceiling_pct <= 100.0) {
            return Err(BotError::Configuration(format!(
                "margin_ceiling_pct must be in (0, 100] (got {})",
                raw.margin_ceiling_pct
            )));
        }
        require_positive("take_profit_pct", raw.take_profit_pct)?;
        require_positive("stop_loss_pct", raw.stop_loss_pct)?;
        let cycle_range = MIN_CYCLE_INTERVAL_SECS..=MAX_CYCLE_INTERVAL_SECS;
        if !cycle_range.contains(&raw.cycle_interval_secs) {
            return Err(BotError::Configuration(format!(
                "cycle_interval_secs must be between {} and {} (got {})",
                MIN_CYCLE_INTERVAL_SECS, MAX_CYCLE_INTERVAL_SECS, raw.cycle_interval_secs
            )));
        }
        if raw.trading_fee_pct < 0.0 {
            return Err(BotError::Configuration(
                "trading_fee_pct must not be negative".into(),
            ));
        }
        if raw.reconcile_every_cycles == 0 {
            return Err(BotError::Configuration(
                "reconcile_every_cycles must be at least 1".into(),
            ));
        }
        if raw.max_order_attempts == 0 {
            return Err(BotError::Configuration(
                "max_order_attempts must be at least 1".into(),
            ));
        }

        let strategy = raw.strategy.clone();
        if strategy.sma_short == 0 || strategy.sma_short >= strategy.sma_long {
            return Err(BotError::Configuration(format!(
                "sma_short ({}) must be positive and below sma_long ({})",
                strategy.sma_short, strategy.sma_long
            )));
        }
        if strategy.rsi_period == 0 {
            return Err(BotError::Configuration("rsi_period must be positive".into()));
        }
        if !(0.0 < strategy.rsi_oversold
            && strategy.rsi_oversold < strategy.rsi_overbought
            && strategy.rsi_overbought < 100.0)
        {
            return Err(BotError::Configuration(format!(
                "RSI thresholds must satisfy 0 < oversold ({}) < overbought ({}) < 100",
                strategy.rsi_oversold, strategy.rsi_overbought
            )));
        }
        if raw.kline_limit < strategy.min_candles() + 1 {
            return Err(BotError::Configuration(format!(
                "kline_limit {} is too small for the indicator periods (need {})",
                raw.kline_limit,
                strategy.min_candles() + 1
            )));
        }

        let credentials = match (raw.api_key, raw.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials {
                    api_key: key,
                    api_secret: secret,
                })
            }
            _ => None,
        };
        if credentials.is_none() && !raw.dry_run {
            return Err(BotError::Configuration(format!(
                "missing credentials: set {} and {} (or enable dry_run)",
                ENV_API_KEY, ENV_API_SECRET
            )));
        }

        if let Some(total) = raw.total_margin {
            require_positive("total_margin", total)?;
        }
        if raw.dry_run {
            require_positive("paper_balance", raw.paper_balance)?;
        }

        Ok(Self {
            symbols,
            base_url: raw.base_url.trim_end_matches('/').to_string(),
            credentials,
            dry_run: raw.dry_run,
            paper_balance: raw.paper_balance,
            total_margin: raw.total_margin,
            leverage: raw.leverage,
            margin_per_trade,
            margin_ceiling: raw.margin_ceiling_pct / 100.0,
            max_concurrent_positions: MAX_CONCURRENT_POSITIONS,
            take_profit_pct: raw.take_profit_pct,
            stop_loss_pct: raw.stop_loss_pct,
            trading_fee_pct: raw.trading_fee_pct,
            cycle_interval: Duration::from_secs_f64(raw.cycle_interval_secs),
            reconcile_every_cycles: raw.reconcile_every_cycles,
            pending_timeout: Duration::from_secs(raw.pending_timeout_secs),
            max_hold: (raw.max_hold_secs > 0).then(|| Duration::from_secs(raw.max_hold_secs)),
            kline_interval: raw.kline_interval,
            kline_limit: raw.kline_limit,
            request_timeout: Duration::from_millis(raw.request_timeout_ms.max(1)),
            max_order_attempts: raw.max_order_attempts,
            retry_base_delay: Duration::from_millis(raw.retry_base_delay_ms),
            event_log_capacity: raw.event_log_capacity.max(1),
            closed_history: raw.closed_history,
            close_positions_on_shutdown: raw.close_positions_on_shutdown,
            adopted_positions_count_against_ceiling: raw.adopted_positions_count_against_ceiling,
            strategy,
        })
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }

    pub fn symbol_names(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.symbol.clone()).collect()
    }
}

const MIN_CYCLE_INTERVAL_SECS: f64 = 0.001;
const MAX_CYCLE_INTERVAL_SECS: f64 = 86_400.0;

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(BotError::Configuration(format!(
            "{} must be positive (got {})",
            name, value
        )))
    }
}

fn resolve_symbol(entry: &RawSymbol, leverage: u32) -> Result<SymbolConfig> {
    let (name, step, min_qty, min_notional) = match entry {
        RawSymbol::Name(name) => (name.as_str(), None, None, None),
        RawSymbol::Detailed {
            symbol,
            step_size,
            min_qty,
            min_notional,
        } => (symbol.as_str(), *step_size, *min_qty, *min_notional),
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return Err(BotError::Configuration(format!(
            "invalid symbol '{}': expected upper-case alphanumeric like BTCUSDT",
            name
        )));
    }

    let (default_step, default_min_qty, default_notional) = default_precision(name);
    let symbol = SymbolConfig {
        symbol: name.to_string(),
        leverage,
        step_size: step.unwrap_or(default_step),
        min_qty: min_qty.unwrap_or(default_min_qty),
        min_notional: min_notional.unwrap_or(default_notional),
    };

    require_positive(&format!("{} step_size", name), symbol.step_size)?;
    if symbol.min_qty < 0.0 || symbol.min_notional < 0.0 {
        return Err(BotError::Configuration(format!(
            "{} min_qty/min_notional must not be negative",
            name
        )));
    }

    Ok(symbol)
}

/// Lot precision used when the symbol entry does not specify its own
fn default_precision(symbol: &str) -> (f64, f64, f64) {
    match symbol {
        "SOLUSDT" | "BNBUSDT" => (0.01, 0.01, 5.0),
        "XRPUSDT" | "DOGEUSDT" | "ADAUSDT" | "MATICUSDT" => (1.0, 1.0, 5.0),
        _ => (0.001, 0.001, 5.0),
    }
}
