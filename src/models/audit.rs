use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum AuditAction {
    ServeNext,
    Complete,
    Skip,
    Cancel,
    Pause,
    Resume,
    Reorder,
    Priority,
    SendSms,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ServeNext => "serve_next",
            AuditAction::Complete => "complete",
            AuditAction::Skip => "skip",
            AuditAction::Cancel => "cancel",
            AuditAction::Pause => "pause",
            AuditAction::Resume => "resume",
            AuditAction::Reorder => "reorder",
            AuditAction::Priority => "priority",
            AuditAction::SendSms => "send_sms",
        }
    }
}

/// One administrative action against a service queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub service_id: Uuid,
    pub action: AuditAction,
    pub target_token_id: Option<Uuid>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor_id: Uuid, service_id: Uuid, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            service_id,
            action,
            target_token_id: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn target(mut self, token_id: Uuid) -> Self {
        self.target_token_id = Some(token_id);
        self
    }

    pub fn reason(mut self, reason: Option<&str>) -> Self {
        self.reason = reason.map(str::to_string);
        self
    }
}
