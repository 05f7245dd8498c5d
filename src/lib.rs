//! Smart Queue: token lifecycle and scheduling engine.
//!
//! Library crate shared by the `smartq` binary and the integration tests in
//! `tests/`. The engine is storage-agnostic: `store::postgres::PgStore` backs
//! production, `store::memory::MemoryStore` backs tests and local tooling.

pub mod audit;
pub mod config;
pub mod errors;
pub mod models;
pub mod notification;
pub mod scheduler;
pub mod store;

pub use errors::{QueueError, QueueResult};
