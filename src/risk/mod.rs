// Risk management module
pub mod admission;

pub use admission::{round_down_to_step, Admission, RejectReason, RiskManager};
