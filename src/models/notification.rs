use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contact details for a user, owned by the identity system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: Uuid,
    pub phone_number: Option<String>,
    pub sms_opt_in: bool,
}

/// Audit row for a manual, admin-triggered token SMS.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct NotificationLog {
    pub id: Uuid,
    pub admin_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub token_number: Option<i32>,
    pub phone_number: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
    pub success: bool,
    pub provider_id: Option<String>,
    pub details: Option<String>,
}

impl NotificationLog {
    /// A freshly accepted send: not yet delivered.
    pub fn pending(
        admin_id: Option<Uuid>,
        token_id: Uuid,
        token_number: i32,
        phone_number: &str,
        message: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            admin_id,
            token_id: Some(token_id),
            token_number: Some(token_number),
            phone_number: phone_number.to_string(),
            message: message.to_string(),
            sent_at: Utc::now(),
            success: false,
            provider_id: None,
            details: None,
        }
    }
}

/// Final result of a background delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub provider_id: Option<String>,
    pub details: String,
    pub finished_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    pub fn delivered(provider_id: Option<String>, details: String) -> Self {
        Self {
            success: true,
            provider_id,
            details,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(details: String) -> Self {
        Self {
            success: false,
            provider_id: None,
            details,
            finished_at: Utc::now(),
        }
    }
}
