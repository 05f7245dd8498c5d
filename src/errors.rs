use thiserror::Error;
use uuid::Uuid;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("token not found: {0}")]
    TokenNotFound(Uuid),

    /// Malformed input. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// `(service, token_number)` already taken. The issuer retries this once.
    #[error("token number {token_number} already issued for service {service_id}")]
    Conflict { service_id: Uuid, token_number: i32 },

    /// The requested transition is not allowed from the token's current state.
    #[error("invalid token state: {0}")]
    State(String),

    /// Lock wait, deadlock or a repeated issuance conflict. Safe to resubmit.
    #[error("operation aborted, retry later: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Whether the caller may resubmit the same request (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Fatal(_))
    }

    /// Short machine-readable code for tooling output.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::ServiceNotFound(_) => "service_not_found",
            QueueError::TokenNotFound(_) => "token_not_found",
            QueueError::Validation(_) => "validation_error",
            QueueError::Conflict { .. } => "conflict",
            QueueError::State(_) => "state_error",
            QueueError::Fatal(_) => "retryable_failure",
            QueueError::Database(_) => "internal_error",
        }
    }
}
