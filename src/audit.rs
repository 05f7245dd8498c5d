use std::sync::{Arc, Mutex};

use sqlx::PgPool;

use crate::models::audit::AuditEvent;

/// Write-only sink for administrative actions.
///
/// `record` must not block and must not fail the caller: scheduling results
/// stand whether or not the audit row lands.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Async audit log writer. Fires off a Tokio task to insert
/// the event into PG without blocking the scheduling path.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditSink {
    fn record(&self, event: AuditEvent) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = insert_audit_log(&pool, &event).await {
                tracing::error!(
                    audit_id = %event.id,
                    action = event.action.as_str(),
                    "failed to write audit log: {}",
                    e
                );
            } else {
                tracing::debug!(audit_id = %event.id, action = event.action.as_str(), "audit log recorded");
            }
        });
    }
}

async fn insert_audit_log(pool: &PgPool, event: &AuditEvent) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, actor_id, service_id, target_token_id, action, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.id)
    .bind(event.actor_id)
    .bind(event.service_id)
    .bind(event.target_token_id)
    .bind(event.action)
    .bind(&event.reason)
    .bind(event.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Keeps events in memory; used by tests and library embedders.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(action = event.action.as_str(), service_id = %event.service_id, "audit event");
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::AuditAction;
    use uuid::Uuid;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        let admin = Uuid::new_v4();
        let svc = Uuid::new_v4();
        sink.record(AuditEvent::new(admin, svc, AuditAction::Pause));
        sink.record(AuditEvent::new(admin, svc, AuditAction::Resume).reason(Some("lunch over")));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, AuditAction::Pause);
        assert_eq!(events[1].reason.as_deref(), Some("lunch over"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(AuditAction::ServeNext.as_str(), "serve_next");
        assert_eq!(AuditAction::SendSms.as_str(), "send_sms");
        let json = serde_json::to_string(&AuditAction::Reorder).unwrap();
        assert_eq!(json, "\"reorder\"");
    }
}
