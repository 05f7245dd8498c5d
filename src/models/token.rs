use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{QueueError, QueueResult};

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TokenStatus {
    Waiting,
    Serving,
    Completed,
    Cancelled,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenStatus::Completed | TokenStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Waiting => "waiting",
            TokenStatus::Serving => "serving",
            TokenStatus::Completed => "completed",
            TokenStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queue ticket for one user at one service.
///
/// Status changes go through the transition methods below, which refuse to
/// leave a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: Uuid,
    pub service_id: Uuid,
    pub user_id: Uuid,
    /// Unique within the service, strictly positive, never reused.
    pub token_number: i32,
    pub status: TokenStatus,
    /// Higher is served earlier.
    pub priority_level: i32,
    pub counter_number: Option<i32>,
    pub skip_reason: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub service_start_time: Option<DateTime<Utc>>,
    pub service_end_time: Option<DateTime<Utc>>,
    // legacy mirrors of start/end
    pub served_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_not_terminal(&self, action: &str) -> QueueResult<()> {
        if self.is_terminal() {
            return Err(QueueError::State(format!(
                "cannot {} token {} (#{}): already {}",
                action, self.id, self.token_number, self.status
            )));
        }
        Ok(())
    }

    /// waiting → serving
    pub fn start_serving(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if self.status != TokenStatus::Waiting {
            return Err(QueueError::State(format!(
                "cannot serve token {} (#{}): status is {}",
                self.id, self.token_number, self.status
            )));
        }
        self.status = TokenStatus::Serving;
        self.service_start_time = Some(now);
        self.served_at = Some(now);
        Ok(())
    }

    /// waiting|serving → completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_not_terminal("complete")?;
        self.status = TokenStatus::Completed;
        self.stamp_end(now);
        Ok(())
    }

    /// waiting|serving → cancelled, keeping `reason` as the skip reason.
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: Option<&str>) -> QueueResult<()> {
        self.ensure_not_terminal("cancel")?;
        self.status = TokenStatus::Cancelled;
        self.stamp_end(now);
        if let Some(r) = reason {
            self.skip_reason = Some(r.to_string());
        }
        Ok(())
    }

    pub fn set_priority(&mut self, level: i32) -> QueueResult<()> {
        self.ensure_not_terminal("reprioritise")?;
        self.priority_level = level;
        Ok(())
    }

    fn stamp_end(&mut self, now: DateTime<Utc>) {
        self.service_end_time = Some(now);
        self.completed_at = Some(now);
    }
}

/// Order in which waiting tokens are called: priority descending, then
/// token number ascending. The Postgres backend encodes the same rule as
/// `ORDER BY priority_level DESC, token_number ASC`.
pub fn serve_order(a: &Token, b: &Token) -> Ordering {
    b.priority_level
        .cmp(&a.priority_level)
        .then_with(|| a.token_number.cmp(&b.token_number))
}

/// Insert payload produced by the issuer.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub id: Uuid,
    pub service_id: Uuid,
    pub user_id: Uuid,
    pub token_number: i32,
    pub priority_level: i32,
    pub joined_at: DateTime<Utc>,
}

impl NewToken {
    pub(crate) fn into_token(self) -> Token {
        Token {
            id: self.id,
            service_id: self.service_id,
            user_id: self.user_id,
            token_number: self.token_number,
            status: TokenStatus::Waiting,
            priority_level: self.priority_level,
            counter_number: None,
            skip_reason: None,
            joined_at: self.joined_at,
            service_start_time: None,
            service_end_time: None,
            served_at: None,
            completed_at: None,
        }
    }
}
