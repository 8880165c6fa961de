// Order execution and position bookkeeping
pub mod gateway;
pub mod ledger;
pub mod retry;

pub use gateway::ExecutionGateway;
pub use ledger::{lock_ledger, LedgerSettings, PositionLedger, RiskBudget, SharedLedger};
pub use retry::{with_retry, ExponentialBackoff, RetryPolicy};
