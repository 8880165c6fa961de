// Core modules
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod market_data;
pub mod models;
pub mod reconcile;
pub mod risk;
pub mod status;
pub mod strategy;

// Re-export commonly used types
pub use config::BotConfig;
pub use engine::{Bot, BotHandle};
pub use error::BotError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
