use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{QueueError, QueueResult};
use crate::models::token::{NewToken, Token};
use crate::store::{QueueStore, QueueTx};

/// Hands out sequential token numbers per service.
///
/// A user holds at most one active token per service: asking again while a
/// waiting or serving token exists returns that token unchanged.
///
/// The service row lock serialises concurrent issuers; the stored
/// `last_token_number` is reconciled against the highest number actually
/// present so a counter that drifted behind the data can never cause reuse.
pub struct TokenIssuer<S> {
    store: Arc<S>,
}

impl<S> Clone for TokenIssuer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: QueueStore> TokenIssuer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn issue_token(&self, user_id: Uuid, service_id: Uuid) -> QueueResult<Token> {
        self.issue_priority_token(user_id, service_id, 0).await
    }

    /// Issue a waiting token with an explicit priority level.
    ///
    /// A number collision on insert is retried once in a fresh transaction;
    /// a second collision is returned as a retryable `Fatal`.
    pub async fn issue_priority_token(
        &self,
        user_id: Uuid,
        service_id: Uuid,
        priority_level: i32,
    ) -> QueueResult<Token> {
        match self.try_issue(user_id, service_id, priority_level).await {
            Err(QueueError::Conflict { token_number, .. }) => {
                warn!(
                    %service_id,
                    token_number,
                    "token number collided on insert, retrying issuance once"
                );
                match self.try_issue(user_id, service_id, priority_level).await {
                    Err(QueueError::Conflict { token_number, .. }) => Err(QueueError::Fatal(format!(
                        "token number {} collided twice for service {}",
                        token_number, service_id
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_issue(&self, user_id: Uuid, service_id: Uuid, priority_level: i32) -> QueueResult<Token> {
        let mut tx = self.store.lock_service(service_id).await?;

        if let Some(existing) = tx.active_token_for_user(user_id).await? {
            info!(
                %service_id,
                %user_id,
                token_number = existing.token_number,
                "user already queued, returning active token"
            );
            return Ok(existing);
        }

        let stored = tx.service().last_token_number;
        let max_existing = tx.max_token_number().await?;
        let next = stored
            .max(max_existing)
            .checked_add(1)
            .ok_or_else(|| QueueError::Validation(format!("token numbers exhausted for service {}", service_id)))?;

        if max_existing > stored {
            warn!(
                %service_id,
                stored,
                max_existing,
                "last issued counter lagged behind stored tokens, reconciling"
            );
        }

        tx.set_last_issued(next).await?;
        let token = tx
            .insert_token(NewToken {
                id: Uuid::new_v4(),
                service_id,
                user_id,
                token_number: next,
                priority_level,
                joined_at: Utc::now(),
            })
            .await?;
        tx.commit().await?;

        info!(
            %service_id,
            token_id = %token.id,
            token_number = token.token_number,
            priority_level,
            "token issued"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::models::service::{NewService, Service, StatusCounts};
    use crate::store::memory::{MemoryStore, MemoryTx};

    /// Forces the next `remaining` inserts to report a number collision.
    struct CollidingStore {
        inner: MemoryStore,
        remaining: Arc<AtomicUsize>,
    }

    struct CollidingTx {
        inner: MemoryTx,
        remaining: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueueStore for CollidingStore {
        type Tx = CollidingTx;

        async fn lock_service(&self, service_id: Uuid) -> QueueResult<CollidingTx> {
            Ok(CollidingTx {
                inner: self.inner.lock_service(service_id).await?,
                remaining: self.remaining.clone(),
            })
        }
        async fn get_service(&self, id: Uuid) -> QueueResult<Option<Service>> {
            self.inner.get_service(id).await
        }
        async fn get_token(&self, id: Uuid) -> QueueResult<Option<Token>> {
            self.inner.get_token(id).await
        }
        async fn count_waiting_before(&self, id: Uuid, n: i32) -> QueueResult<i64> {
            self.inner.count_waiting_before(id, n).await
        }
        async fn current_serving(&self, id: Uuid) -> QueueResult<Option<Token>> {
            self.inner.current_serving(id).await
        }
        async fn active_tokens(&self, id: Uuid) -> QueueResult<Vec<Token>> {
            self.inner.active_tokens(id).await
        }
        async fn status_counts(&self, id: Uuid) -> QueueResult<StatusCounts> {
            self.inner.status_counts(id).await
        }
        async fn tokens_for_user(&self, id: Uuid) -> QueueResult<Vec<Token>> {
            self.inner.tokens_for_user(id).await
        }
    }

    #[async_trait]
    impl QueueTx for CollidingTx {
        fn service(&self) -> &Service {
            self.inner.service()
        }
        async fn serving_token(&mut self) -> QueueResult<Option<Token>> {
            self.inner.serving_token().await
        }
        async fn next_waiting(&mut self) -> QueueResult<Option<Token>> {
            self.inner.next_waiting().await
        }
        async fn waiting_tokens(&mut self) -> QueueResult<Vec<Token>> {
            self.inner.waiting_tokens().await
        }
        async fn token(&mut self, id: Uuid) -> QueueResult<Option<Token>> {
            self.inner.token(id).await
        }
        async fn active_token_for_user(&mut self, user_id: Uuid) -> QueueResult<Option<Token>> {
            self.inner.active_token_for_user(user_id).await
        }
        async fn max_token_number(&mut self) -> QueueResult<i32> {
            self.inner.max_token_number().await
        }
        async fn set_last_issued(&mut self, n: i32) -> QueueResult<()> {
            self.inner.set_last_issued(n).await
        }
        async fn set_paused(&mut self, paused: bool) -> QueueResult<()> {
            self.inner.set_paused(paused).await
        }
        async fn insert_token(&mut self, token: NewToken) -> QueueResult<Token> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::Conflict {
                    service_id: token.service_id,
                    token_number: token.token_number,
                });
            }
            self.inner.insert_token(token).await
        }
        async fn update_token(&mut self, token: &Token) -> QueueResult<()> {
            self.inner.update_token(token).await
        }
        async fn renumber(&mut self, a: &[(Uuid, i32)]) -> QueueResult<()> {
            self.inner.renumber(a).await
        }
        async fn commit(self) -> QueueResult<()> {
            self.inner.commit().await
        }
    }

    fn colliding(collisions: usize) -> (Arc<CollidingStore>, Uuid) {
        let inner = MemoryStore::new();
        let svc = inner.create_service(NewService::named("OPD"));
        let store = Arc::new(CollidingStore {
            inner,
            remaining: Arc::new(AtomicUsize::new(collisions)),
        });
        (store, svc.id)
    }

    #[tokio::test]
    async fn test_first_token_is_one() {
        let store = Arc::new(MemoryStore::new());
        let svc = store.create_service(NewService::named("OPD"));
        let issuer = TokenIssuer::new(store.clone());

        let t = issuer.issue_token(Uuid::new_v4(), svc.id).await.unwrap();
        assert_eq!(t.token_number, 1);
        assert_eq!(t.priority_level, 0);

        let svc = store.get_service(svc.id).await.unwrap().unwrap();
        assert_eq!(svc.last_token_number, 1);
    }

    #[tokio::test]
    async fn test_single_collision_is_retried() {
        let (store, service_id) = colliding(1);
        let issuer = TokenIssuer::new(store.clone());

        let t = issuer.issue_token(Uuid::new_v4(), service_id).await.unwrap();
        assert_eq!(t.token_number, 1);
        assert_eq!(store.status_counts(service_id).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_second_collision_is_fatal_and_retryable() {
        let (store, service_id) = colliding(2);
        let issuer = TokenIssuer::new(store.clone());

        let err = issuer.issue_token(Uuid::new_v4(), service_id).await.unwrap_err();
        assert!(matches!(err, QueueError::Fatal(_)));
        assert!(err.is_retryable());

        // nothing from either attempt was committed
        let svc = store.get_service(service_id).await.unwrap().unwrap();
        assert_eq!(svc.last_token_number, 0);
        assert_eq!(store.status_counts(service_id).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_repeat_request_returns_active_token() {
        let store = Arc::new(MemoryStore::new());
        let svc = store.create_service(NewService::named("OPD"));
        let issuer = TokenIssuer::new(store.clone());
        let user = Uuid::new_v4();

        let first = issuer.issue_token(user, svc.id).await.unwrap();
        let again = issuer.issue_priority_token(user, svc.id, 5).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.priority_level, 0);

        let svc_now = store.get_service(svc.id).await.unwrap().unwrap();
        assert_eq!(svc_now.last_token_number, 1);
        assert_eq!(store.status_counts(svc.id).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let issuer = TokenIssuer::new(store);
        let err = issuer.issue_token(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::ServiceNotFound(_)));
    }
}
