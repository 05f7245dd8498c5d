//! Per-service queue state machine.
//!
//! Every operation runs in one transaction holding the service lock, so the
//! read-modify-write of "who is serving" is atomic with respect to every other
//! operation on the same service. Audit events are emitted only after commit.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::errors::{QueueError, QueueResult};
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::service::{Service, StatusCounts};
use crate::models::token::{Token, TokenStatus};
use crate::store::{QueueStore, QueueTx};

/// Result of a complete-and-serve step. Either side may be absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServeOutcome {
    pub completed: Option<Token>,
    pub next: Option<Token>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub cancelled: Token,
    /// Token promoted because the cancelled one had been serving.
    pub next: Option<Token>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub service: Service,
    /// Waiting and serving tokens by token number.
    pub tokens: Vec<Token>,
    pub counts: StatusCounts,
}

pub struct QueueScheduler<S> {
    store: Arc<S>,
    audit: Arc<dyn AuditSink>,
}

impl<S> Clone for QueueScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S: QueueStore> QueueScheduler<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Complete the serving token (if any) and, unless the service is paused,
    /// start serving the next waiting token.
    pub async fn serve_next_and_complete_current(&self, service_id: Uuid) -> QueueResult<ServeOutcome> {
        let mut tx = self.store.lock_service(service_id).await?;
        let outcome = complete_current_and_promote(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Admin "call next": [`Self::serve_next_and_complete_current`] plus an audit record.
    pub async fn call_next(&self, service_id: Uuid, admin_id: Uuid) -> QueueResult<ServeOutcome> {
        let outcome = self.serve_next_and_complete_current(service_id).await?;
        self.audit
            .record(AuditEvent::new(admin_id, service_id, AuditAction::ServeNext));
        Ok(outcome)
    }

    /// Start serving the next waiting token only when nothing is serving and
    /// the service is running.
    pub async fn serve_next_without_completing(&self, service_id: Uuid) -> QueueResult<Option<Token>> {
        let mut tx = self.store.lock_service(service_id).await?;
        if tx.service().paused {
            return Ok(None);
        }
        if tx.serving_token().await?.is_some() {
            return Ok(None);
        }
        let next = promote_next(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Cancel a token. If it was serving, the next eligible token is promoted
    /// in the same transaction.
    ///
    /// With an acting admin the audit action is `skip` when a reason is given,
    /// `cancel` otherwise.
    pub async fn skip_or_cancel(
        &self,
        token_id: Uuid,
        admin_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> QueueResult<CancelOutcome> {
        let reason = non_blank(reason);
        let (mut tx, token) = self.lock_token(token_id).await?;
        let outcome = cancel_locked(&mut tx, token, reason).await?;
        tx.commit().await?;

        if let Some(admin_id) = admin_id {
            let action = if reason.is_some() {
                AuditAction::Skip
            } else {
                AuditAction::Cancel
            };
            self.audit.record(
                AuditEvent::new(admin_id, outcome.cancelled.service_id, action)
                    .target(outcome.cancelled.id)
                    .reason(reason),
            );
        }
        Ok(outcome)
    }

    /// A user withdrawing their own waiting token.
    pub async fn cancel_own_token(&self, token_id: Uuid, user_id: Uuid) -> QueueResult<CancelOutcome> {
        let (mut tx, token) = self.lock_token(token_id).await?;
        if token.user_id != user_id {
            return Err(QueueError::TokenNotFound(token_id));
        }
        if token.status != TokenStatus::Waiting {
            warn!(%token_id, status = %token.status, "owner cancel rejected");
            return Err(QueueError::State(format!(
                "only waiting tokens can be cancelled by their owner (token is {})",
                token.status
            )));
        }
        let outcome = cancel_locked(&mut tx, token, None).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Complete one specific token. A serving token goes through the shared
    /// complete-and-promote step; a waiting token is closed without promotion.
    pub async fn complete_token(&self, token_id: Uuid, admin_id: Option<Uuid>) -> QueueResult<ServeOutcome> {
        let now = Utc::now();
        let (mut tx, mut token) = self.lock_token(token_id).await?;

        let outcome = match token.status {
            TokenStatus::Serving => complete_current_and_promote(&mut tx, now).await?,
            TokenStatus::Waiting => {
                token.complete(now)?;
                tx.update_token(&token).await?;
                info!(%token_id, token_number = token.token_number, "waiting token completed");
                ServeOutcome {
                    completed: Some(token.clone()),
                    next: None,
                }
            }
            TokenStatus::Completed | TokenStatus::Cancelled => {
                warn!(%token_id, status = %token.status, "complete rejected on terminal token");
                return Err(QueueError::State(format!(
                    "token #{} is already {}",
                    token.token_number, token.status
                )));
            }
        };
        tx.commit().await?;

        if let Some(admin_id) = admin_id {
            self.audit.record(
                AuditEvent::new(admin_id, token.service_id, AuditAction::Complete).target(token_id),
            );
        }
        Ok(outcome)
    }

    pub async fn set_priority(&self, token_id: Uuid, level: i32, admin_id: Option<Uuid>) -> QueueResult<Token> {
        let (mut tx, mut token) = self.lock_token(token_id).await?;
        token.set_priority(level)?;
        tx.update_token(&token).await?;
        tx.commit().await?;

        info!(%token_id, priority_level = level, "token priority changed");
        if let Some(admin_id) = admin_id {
            self.audit.record(
                AuditEvent::new(admin_id, token.service_id, AuditAction::Priority).target(token_id),
            );
        }
        Ok(token)
    }

    /// Renumber the waiting tokens of a paused service in the given order,
    /// starting from the lowest waiting number.
    ///
    /// `ordered_ids` must be exactly the current waiting set. Any mismatch is
    /// rejected before a single number changes.
    pub async fn reorder_waiting(
        &self,
        service_id: Uuid,
        ordered_ids: &[Uuid],
        admin_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> QueueResult<()> {
        let mut tx = self.store.lock_service(service_id).await?;
        if !tx.service().paused {
            return Err(QueueError::Validation(
                "service must be paused to reorder tokens".into(),
            ));
        }

        let waiting = tx.waiting_tokens().await?;
        let current: HashSet<Uuid> = waiting.iter().map(|t| t.id).collect();
        let requested: HashSet<Uuid> = ordered_ids.iter().copied().collect();
        if requested.len() != ordered_ids.len() {
            return Err(QueueError::Validation("ordered ids contain duplicates".into()));
        }
        if requested != current {
            return Err(QueueError::Validation(
                "ordered ids must match existing waiting token ids".into(),
            ));
        }

        let base = waiting.iter().map(|t| t.token_number).min().unwrap_or(1);
        let assignments: Vec<(Uuid, i32)> = ordered_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, base + idx as i32))
            .collect();

        tx.renumber(&assignments).await.map_err(|e| match e {
            QueueError::Conflict { .. } => QueueError::Validation(
                "new order would reuse a number held by a serving or finished token".into(),
            ),
            other => other,
        })?;
        tx.commit().await?;

        info!(%service_id, tokens = assignments.len(), base, "waiting tokens reordered");
        if let Some(admin_id) = admin_id {
            self.audit
                .record(AuditEvent::new(admin_id, service_id, AuditAction::Reorder).reason(non_blank(reason)));
        }
        Ok(())
    }

    /// Stop promoting tokens. A token already serving keeps serving.
    pub async fn pause(&self, service_id: Uuid, admin_id: Option<Uuid>) -> QueueResult<Service> {
        self.set_paused(service_id, true, admin_id).await
    }

    pub async fn resume(&self, service_id: Uuid, admin_id: Option<Uuid>) -> QueueResult<Service> {
        self.set_paused(service_id, false, admin_id).await
    }

    async fn set_paused(&self, service_id: Uuid, paused: bool, admin_id: Option<Uuid>) -> QueueResult<Service> {
        let mut tx = self.store.lock_service(service_id).await?;
        tx.set_paused(paused).await?;
        let service = tx.service().clone();
        tx.commit().await?;

        info!(%service_id, paused, "service pause flag set");
        if let Some(admin_id) = admin_id {
            let action = if paused {
                AuditAction::Pause
            } else {
                AuditAction::Resume
            };
            self.audit.record(AuditEvent::new(admin_id, service_id, action));
        }
        Ok(service)
    }

    pub async fn snapshot(&self, service_id: Uuid) -> QueueResult<QueueSnapshot> {
        let service = self
            .store
            .get_service(service_id)
            .await?
            .ok_or(QueueError::ServiceNotFound(service_id))?;
        let tokens = self.store.active_tokens(service_id).await?;
        let counts = self.store.status_counts(service_id).await?;
        Ok(QueueSnapshot {
            service,
            tokens,
            counts,
        })
    }

    pub async fn tokens_for_user(&self, user_id: Uuid) -> QueueResult<Vec<Token>> {
        self.store.tokens_for_user(user_id).await
    }

    /// Lock the token's service, then the token row itself.
    async fn lock_token(&self, token_id: Uuid) -> QueueResult<(S::Tx, Token)> {
        let snapshot = self
            .store
            .get_token(token_id)
            .await?
            .ok_or(QueueError::TokenNotFound(token_id))?;
        let mut tx = self.store.lock_service(snapshot.service_id).await?;
        let token = tx
            .token(token_id)
            .await?
            .ok_or(QueueError::TokenNotFound(token_id))?;
        Ok((tx, token))
    }
}

/// Shared by serve-next, complete and skip: close the serving token, then
/// promote the next one.
async fn complete_current_and_promote<T: QueueTx>(tx: &mut T, now: DateTime<Utc>) -> QueueResult<ServeOutcome> {
    let completed = match tx.serving_token().await? {
        Some(mut current) => {
            current.complete(now)?;
            tx.update_token(&current).await?;
            info!(
                service_id = %current.service_id,
                token_number = current.token_number,
                "token completed"
            );
            Some(current)
        }
        None => None,
    };
    let next = promote_next(tx, now).await?;
    Ok(ServeOutcome { completed, next })
}

/// The only place a token enters `serving`.
async fn promote_next<T: QueueTx>(tx: &mut T, now: DateTime<Utc>) -> QueueResult<Option<Token>> {
    if tx.service().paused {
        info!(service_id = %tx.service().id, "service paused, not promoting");
        return Ok(None);
    }
    let Some(mut next) = tx.next_waiting().await? else {
        return Ok(None);
    };
    next.start_serving(now)?;
    tx.update_token(&next).await?;
    info!(
        service_id = %next.service_id,
        token_id = %next.id,
        token_number = next.token_number,
        priority_level = next.priority_level,
        "now serving"
    );
    Ok(Some(next))
}

async fn cancel_locked<T: QueueTx>(tx: &mut T, mut token: Token, reason: Option<&str>) -> QueueResult<CancelOutcome> {
    let now = Utc::now();
    let was_serving = token.status == TokenStatus::Serving;
    if let Err(e) = token.cancel(now, reason) {
        warn!(token_id = %token.id, status = %token.status, "cancel rejected on terminal token");
        return Err(e);
    }
    tx.update_token(&token).await?;
    info!(
        service_id = %token.service_id,
        token_id = %token.id,
        token_number = token.token_number,
        was_serving,
        "token cancelled"
    );

    let next = if was_serving {
        complete_current_and_promote(tx, now).await?.next
    } else {
        None
    };
    Ok(CancelOutcome {
        cancelled: token,
        next,
    })
}

fn non_blank(reason: Option<&str>) -> Option<&str> {
    reason.map(str::trim).filter(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_blank_reason() {
        assert_eq!(non_blank(Some("  no show ")), Some("no show"));
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(Some("")), None);
        assert_eq!(non_blank(None), None);
    }
}
