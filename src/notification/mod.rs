//! Manual token notifications sent by admins.
//!
//! `send_token_notification` validates synchronously, writes a pending log
//! row, and hands delivery to a detached Tokio task. Provider failures are
//! recorded on the log row and never reach the caller.

pub mod sms;

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::notification::{DeliveryOutcome, NotificationLog};
use crate::models::token::Token;
use crate::store::{ContactDirectory, NotificationLogStore};
use sms::{format_indian, SmsProvider};

/// Longest message accepted, in characters (one SMS segment).
pub const MAX_MESSAGE_LEN: usize = 160;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters ({len})")]
    MessageTooLong { len: usize, max: usize },

    #[error("no contact record for user {0}")]
    MissingRecipient(Uuid),

    #[error("user has opted out of SMS")]
    OptedOut,

    #[error("invalid or missing phone number for user")]
    InvalidRecipient,

    #[error("cannot send SMS for a {0} token")]
    TokenTerminal(String),

    #[error("notification log error: {0}")]
    Log(#[from] anyhow::Error),
}

/// Returned once a message is accepted for delivery.
pub struct NotificationHandle {
    pub log_id: Uuid,
    delivery: JoinHandle<DeliveryOutcome>,
}

impl NotificationHandle {
    /// Wait for the background attempt. Mostly useful for tooling and tests.
    pub async fn delivered(self) -> DeliveryOutcome {
        match self.delivery.await {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome::failed(format!("delivery task aborted: {}", e)),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    provider: Arc<dyn SmsProvider>,
    contacts: Arc<dyn ContactDirectory>,
    log: Arc<dyn NotificationLogStore>,
    audit: Arc<dyn AuditSink>,
}

impl Notifier {
    pub fn new(
        provider: Arc<dyn SmsProvider>,
        contacts: Arc<dyn ContactDirectory>,
        log: Arc<dyn NotificationLogStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            contacts,
            log,
            audit,
        }
    }

    pub async fn send_token_notification(
        &self,
        token: &Token,
        message: &str,
        admin_id: Option<Uuid>,
    ) -> Result<NotificationHandle, NotificationError> {
        validate_message(message)?;

        let recipient = self
            .contacts
            .recipient(token.user_id)
            .await?
            .ok_or(NotificationError::MissingRecipient(token.user_id))?;
        if !recipient.sms_opt_in {
            return Err(NotificationError::OptedOut);
        }
        let phone = recipient
            .phone_number
            .as_deref()
            .and_then(format_indian)
            .ok_or(NotificationError::InvalidRecipient)?;
        if token.is_terminal() {
            return Err(NotificationError::TokenTerminal(token.status.to_string()));
        }

        let entry = NotificationLog::pending(admin_id, token.id, token.token_number, &phone, message);
        self.log.create(&entry).await?;
        let log_id = entry.id;

        if let Some(admin_id) = admin_id {
            self.audit.record(
                AuditEvent::new(admin_id, token.service_id, AuditAction::SendSms).target(token.id),
            );
        }

        let provider = self.provider.clone();
        let log = self.log.clone();
        let body = message.to_string();
        let delivery = tokio::spawn(async move { deliver(provider, log, log_id, phone, body).await });

        info!(%log_id, token_id = %token.id, "SMS queued for delivery");
        Ok(NotificationHandle { log_id, delivery })
    }
}

/// Blank check on the trimmed text, length check on the text as given.
fn validate_message(message: &str) -> Result<(), NotificationError> {
    if message.trim().is_empty() {
        return Err(NotificationError::EmptyMessage);
    }
    let len = message.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(NotificationError::MessageTooLong {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(())
}

/// Background worker: call the provider and record the result. Never fails.
async fn deliver(
    provider: Arc<dyn SmsProvider>,
    log: Arc<dyn NotificationLogStore>,
    log_id: Uuid,
    to: String,
    body: String,
) -> DeliveryOutcome {
    let outcome = match provider.send(&to, &body).await {
        Ok(receipt) => {
            info!(%log_id, provider_id = ?receipt.provider_id, "SMS delivered");
            DeliveryOutcome::delivered(receipt.provider_id, receipt.details)
        }
        Err(e) => {
            warn!(%log_id, error = %e, "SMS send failed");
            DeliveryOutcome::failed(e.to_string())
        }
    };

    if let Err(e) = log.finish(log_id, &outcome).await {
        error!(%log_id, "failed to record SMS outcome: {}", e);
    }
    outcome
}

/// Canned admin messages for a token.
pub fn message_templates(token_number: i32) -> [(&'static str, String); 3] {
    [
        ("next", format!("Your token #{} is next. Please be ready.", token_number)),
        (
            "serving",
            format!("Now serving token #{}. Proceed to counter.", token_number),
        ),
        (
            "delayed",
            format!("Your token #{} is delayed. We will update soon.", token_number),
        ),
    ]
}
