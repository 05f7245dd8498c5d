use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{QueueError, QueueResult};
use crate::models::token::TokenStatus;
use crate::store::QueueStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtaInfo {
    pub token_id: Uuid,
    pub token_number: i32,
    pub status: TokenStatus,
    pub tokens_ahead: i64,
    pub eta_minutes: i64,
    /// Number of the token at the counter, if any.
    pub current_serving: Option<i32>,
}

/// Read-only wait estimate from a snapshot of the queue.
///
/// Tokens ahead are counted by token number alone: waiting tokens with a
/// lower number, plus the serving token when its number is lower. Priority
/// levels are ignored, so a low-priority token can be told it is closer to
/// the front than it really is.
pub struct EtaEstimator<S> {
    store: Arc<S>,
    default_avg_service_time: i32,
}

impl<S> Clone for EtaEstimator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            default_avg_service_time: self.default_avg_service_time,
        }
    }
}

impl<S: QueueStore> EtaEstimator<S> {
    pub fn new(store: Arc<S>, default_avg_service_time: i32) -> Self {
        Self {
            store,
            default_avg_service_time,
        }
    }

    pub async fn estimate_eta(&self, token_id: Uuid) -> QueueResult<EtaInfo> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or(QueueError::TokenNotFound(token_id))?;
        let service = self
            .store
            .get_service(token.service_id)
            .await?
            .ok_or(QueueError::ServiceNotFound(token.service_id))?;

        let waiting_ahead = self
            .store
            .count_waiting_before(service.id, token.token_number)
            .await?;
        let serving = self.store.current_serving(service.id).await?;
        let serving_ahead = serving
            .as_ref()
            .filter(|s| s.token_number < token.token_number)
            .is_some();

        let tokens_ahead = waiting_ahead + i64::from(serving_ahead);
        let avg = service.effective_avg_service_time(self.default_avg_service_time);
        let eta_minutes = tokens_ahead * i64::from(avg);

        tracing::debug!(
            %token_id,
            token_number = token.token_number,
            tokens_ahead,
            eta_minutes,
            "eta computed"
        );

        Ok(EtaInfo {
            token_id,
            token_number: token.token_number,
            status: token.status,
            tokens_ahead,
            eta_minutes,
            current_serving: serving.map(|s| s.token_number),
        })
    }
}
