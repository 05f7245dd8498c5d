//! Storage seam for the queue engine.
//!
//! Every mutation runs inside a [`QueueTx`] obtained from
//! [`QueueStore::lock_service`], which holds the exclusive lock on one
//! service row until it is committed or dropped. Locks are always taken
//! service first, then token rows.
//!
//! Backends:
//!   - [`postgres::PgStore`]: `SELECT ... FOR UPDATE` inside a sqlx transaction.
//!   - [`memory::MemoryStore`]: per-service `tokio::sync::Mutex` with a
//!     copy-on-commit working set.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::QueueResult;
use crate::models::notification::{DeliveryOutcome, NotificationLog, Recipient};
use crate::models::service::{Service, StatusCounts};
use crate::models::token::{NewToken, Token};

#[async_trait]
pub trait QueueStore: Send + Sync {
    type Tx: QueueTx;

    /// Begin a transaction holding the exclusive lock on `service_id`.
    /// Blocks while another transaction holds it.
    async fn lock_service(&self, service_id: Uuid) -> QueueResult<Self::Tx>;

    // Unlocked snapshot reads.

    async fn get_service(&self, service_id: Uuid) -> QueueResult<Option<Service>>;

    async fn get_token(&self, token_id: Uuid) -> QueueResult<Option<Token>>;

    /// Waiting tokens of the service with a number below `token_number`.
    async fn count_waiting_before(&self, service_id: Uuid, token_number: i32) -> QueueResult<i64>;

    async fn current_serving(&self, service_id: Uuid) -> QueueResult<Option<Token>>;

    /// Waiting and serving tokens ordered by token number.
    async fn active_tokens(&self, service_id: Uuid) -> QueueResult<Vec<Token>>;

    async fn status_counts(&self, service_id: Uuid) -> QueueResult<StatusCounts>;

    /// A user's tokens across services, most recently joined first.
    async fn tokens_for_user(&self, user_id: Uuid) -> QueueResult<Vec<Token>>;
}

/// A transaction scoped to one locked service.
///
/// Dropping it without calling [`QueueTx::commit`] discards every write.
#[async_trait]
pub trait QueueTx: Send {
    /// The locked service row as of the last write in this transaction.
    fn service(&self) -> &Service;

    /// The serving token, row-locked.
    async fn serving_token(&mut self) -> QueueResult<Option<Token>>;

    /// First waiting token by `(priority_level DESC, token_number ASC)`, row-locked.
    async fn next_waiting(&mut self) -> QueueResult<Option<Token>>;

    /// All waiting tokens, row-locked.
    async fn waiting_tokens(&mut self) -> QueueResult<Vec<Token>>;

    /// A token of this service, row-locked. `None` if absent or foreign.
    async fn token(&mut self, token_id: Uuid) -> QueueResult<Option<Token>>;

    /// The user's waiting or serving token for this service, if any.
    async fn active_token_for_user(&mut self, user_id: Uuid) -> QueueResult<Option<Token>>;

    /// Highest token number ever stored for this service, 0 if none.
    async fn max_token_number(&mut self) -> QueueResult<i32>;

    async fn set_last_issued(&mut self, token_number: i32) -> QueueResult<()>;

    async fn set_paused(&mut self, paused: bool) -> QueueResult<()>;

    /// Fails with `QueueError::Conflict` when the number is already taken.
    async fn insert_token(&mut self, token: NewToken) -> QueueResult<Token>;

    /// Persist status, timestamps, priority and skip reason.
    async fn update_token(&mut self, token: &Token) -> QueueResult<()>;

    /// Reassign token numbers. The final set must be unique within the
    /// service; intermediate states may collide.
    async fn renumber(&mut self, assignments: &[(Uuid, i32)]) -> QueueResult<()>;

    async fn commit(self) -> QueueResult<()>;
}

/// Lookup of SMS contact details for users.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn recipient(&self, user_id: Uuid) -> anyhow::Result<Option<Recipient>>;
}

/// Persistence for manual notification records.
#[async_trait]
pub trait NotificationLogStore: Send + Sync {
    async fn create(&self, entry: &NotificationLog) -> anyhow::Result<()>;

    async fn finish(&self, log_id: Uuid, outcome: &DeliveryOutcome) -> anyhow::Result<()>;

    async fn get(&self, log_id: Uuid) -> anyhow::Result<Option<NotificationLog>>;
}
