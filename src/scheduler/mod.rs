//! Token lifecycle engine: issuance, serving order and wait estimates.

pub mod eta;
pub mod issuer;
pub mod queue;

pub use eta::{EtaEstimator, EtaInfo};
pub use issuer::TokenIssuer;
pub use queue::{CancelOutcome, QueueScheduler, QueueSnapshot, ServeOutcome};
