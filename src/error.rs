use thiserror::Error;

/// Failure taxonomy for the trading core
#[derive(Debug, Error)]
pub enum BotError {
    /// Network failure or timeout talking to the exchange. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange refused the request. Never retried.
    #[error("exchange rejected request (code {code}): {message}")]
    ExchangeRejection { code: i64, message: String },

    /// Malformed intent or input; the offending symbol's cycle is skipped
    #[error("validation error for {symbol}: {reason}")]
    Validation { symbol: String, reason: String },

    /// Ledger diverged from the exchange and was corrected
    #[error("reconciliation drift on {symbol}: {detail}")]
    ReconciliationDrift { symbol: String, detail: String },

    /// Fatal at startup only
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BotError {
    /// Only transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Transport(_))
    }

    pub fn validation(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        BotError::Validation {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn rejection(code: i64, message: impl Into<String>) -> Self {
        BotError::ExchangeRejection {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Transport(err.to_string())
    }
}

impl From<::config::ConfigError> for BotError {
    fn from(err: ::config::ConfigError) -> Self {
        BotError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(BotError::Transport("timeout".into()).is_retryable());
        assert!(!BotError::rejection(-2019, "Margin is insufficient").is_retryable());
        assert!(!BotError::validation("BTCUSDT", "bad size").is_retryable());
        assert!(!BotError::Configuration("missing key".into()).is_retryable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = BotError::rejection(-2019, "Margin is insufficient");
        assert!(err.to_string().contains("-2019"));

        let err = BotError::validation("ETHUSDT", "non-positive price");
        assert!(err.to_string().contains("ETHUSDT"));
    }
}
