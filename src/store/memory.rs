//! In-process backend.
//!
//! Each service lives in its own `tokio::sync::Mutex` cell; holding the
//! cell's guard is the service row lock, and since all of a service's tokens
//! live in the same cell it also covers their row locks. A transaction edits
//! a cloned working set and swaps it in on commit, so a dropped transaction
//! leaves no trace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{ContactDirectory, NotificationLogStore, QueueStore, QueueTx};
use crate::errors::{QueueError, QueueResult};
use crate::models::notification::{DeliveryOutcome, NotificationLog, Recipient};
use crate::models::service::{NewService, Service, StatusCounts};
use crate::models::token::{serve_order, NewToken, Token, TokenStatus};

#[derive(Debug, Clone)]
struct ServiceCell {
    service: Service,
    tokens: HashMap<Uuid, Token>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    services: Arc<DashMap<Uuid, Arc<Mutex<ServiceCell>>>>,
    /// token id → service id, for lookups keyed by token.
    token_index: Arc<DashMap<Uuid, Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_service(&self, new: NewService) -> Service {
        let service = new.into_service(Uuid::new_v4());
        self.services.insert(
            service.id,
            Arc::new(Mutex::new(ServiceCell {
                service: service.clone(),
                tokens: HashMap::new(),
            })),
        );
        service
    }

    pub async fn list_services(&self) -> Vec<Service> {
        let mut out = Vec::new();
        for cell in self.cells() {
            out.push(cell.lock().await.service.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Overwrite the stored counter, as a manual data repair would.
    pub async fn repair_last_issued(&self, service_id: Uuid, value: i32) -> QueueResult<()> {
        let cell = self.cell(service_id)?;
        cell.lock().await.service.last_token_number = value;
        Ok(())
    }

    fn cell(&self, service_id: Uuid) -> QueueResult<Arc<Mutex<ServiceCell>>> {
        // clone the Arc out so no DashMap shard guard is held across an await
        self.services
            .get(&service_id)
            .map(|c| c.value().clone())
            .ok_or(QueueError::ServiceNotFound(service_id))
    }

    fn cells(&self) -> Vec<Arc<Mutex<ServiceCell>>> {
        self.services.iter().map(|c| c.value().clone()).collect()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    type Tx = MemoryTx;

    async fn lock_service(&self, service_id: Uuid) -> QueueResult<MemoryTx> {
        let guard = self.cell(service_id)?.lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx {
            guard,
            work,
            token_index: self.token_index.clone(),
            inserted: Vec::new(),
        })
    }

    async fn get_service(&self, service_id: Uuid) -> QueueResult<Option<Service>> {
        match self.cell(service_id) {
            Ok(cell) => Ok(Some(cell.lock().await.service.clone())),
            Err(QueueError::ServiceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_token(&self, token_id: Uuid) -> QueueResult<Option<Token>> {
        let service_id = match self.token_index.get(&token_id) {
            Some(entry) => *entry.value(),
            None => return Ok(None),
        };
        let cell = self.cell(service_id)?;
        let guard = cell.lock().await;
        Ok(guard.tokens.get(&token_id).cloned())
    }

    async fn count_waiting_before(&self, service_id: Uuid, token_number: i32) -> QueueResult<i64> {
        let cell = self.cell(service_id)?;
        let guard = cell.lock().await;
        Ok(guard
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Waiting && t.token_number < token_number)
            .count() as i64)
    }

    async fn current_serving(&self, service_id: Uuid) -> QueueResult<Option<Token>> {
        let cell = self.cell(service_id)?;
        let guard = cell.lock().await;
        Ok(guard
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Serving)
            .min_by_key(|t| t.token_number)
            .cloned())
    }

    async fn active_tokens(&self, service_id: Uuid) -> QueueResult<Vec<Token>> {
        let cell = self.cell(service_id)?;
        let guard = cell.lock().await;
        let mut tokens: Vec<Token> = guard
            .tokens
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.token_number);
        Ok(tokens)
    }

    async fn status_counts(&self, service_id: Uuid) -> QueueResult<StatusCounts> {
        let cell = self.cell(service_id)?;
        let guard = cell.lock().await;
        let mut counts = StatusCounts::default();
        for t in guard.tokens.values() {
            match t.status {
                TokenStatus::Waiting => counts.waiting += 1,
                TokenStatus::Serving => counts.serving += 1,
                TokenStatus::Completed => counts.completed += 1,
                TokenStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn tokens_for_user(&self, user_id: Uuid) -> QueueResult<Vec<Token>> {
        let mut out = Vec::new();
        for cell in self.cells() {
            let guard = cell.lock().await;
            out.extend(guard.tokens.values().filter(|t| t.user_id == user_id).cloned());
        }
        out.sort_by(|a, b| b.joined_at.cmp(&a.joined_at));
        Ok(out)
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<ServiceCell>,
    work: ServiceCell,
    token_index: Arc<DashMap<Uuid, Uuid>>,
    inserted: Vec<Uuid>,
}

impl MemoryTx {
    fn waiting(&self) -> impl Iterator<Item = &Token> {
        self.work
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Waiting)
    }
}

#[async_trait]
impl QueueTx for MemoryTx {
    fn service(&self) -> &Service {
        &self.work.service
    }

    async fn serving_token(&mut self) -> QueueResult<Option<Token>> {
        Ok(self
            .work
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Serving)
            .min_by_key(|t| t.token_number)
            .cloned())
    }

    async fn next_waiting(&mut self) -> QueueResult<Option<Token>> {
        Ok(self.waiting().min_by(|a, b| serve_order(a, b)).cloned())
    }

    async fn waiting_tokens(&mut self) -> QueueResult<Vec<Token>> {
        let mut tokens: Vec<Token> = self.waiting().cloned().collect();
        tokens.sort_by_key(|t| t.token_number);
        Ok(tokens)
    }

    async fn token(&mut self, token_id: Uuid) -> QueueResult<Option<Token>> {
        Ok(self.work.tokens.get(&token_id).cloned())
    }

    async fn active_token_for_user(&mut self, user_id: Uuid) -> QueueResult<Option<Token>> {
        Ok(self
            .work
            .tokens
            .values()
            .filter(|t| t.user_id == user_id && !t.is_terminal())
            .min_by_key(|t| t.token_number)
            .cloned())
    }

    async fn max_token_number(&mut self) -> QueueResult<i32> {
        Ok(self
            .work
            .tokens
            .values()
            .map(|t| t.token_number)
            .max()
            .unwrap_or(0))
    }

    async fn set_last_issued(&mut self, token_number: i32) -> QueueResult<()> {
        self.work.service.last_token_number = token_number;
        Ok(())
    }

    async fn set_paused(&mut self, paused: bool) -> QueueResult<()> {
        self.work.service.paused = paused;
        Ok(())
    }

    async fn insert_token(&mut self, token: NewToken) -> QueueResult<Token> {
        let service_id = self.work.service.id;
        if self
            .work
            .tokens
            .values()
            .any(|t| t.token_number == token.token_number)
        {
            return Err(QueueError::Conflict {
                service_id,
                token_number: token.token_number,
            });
        }
        let token = token.into_token();
        self.inserted.push(token.id);
        self.work.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn update_token(&mut self, token: &Token) -> QueueResult<()> {
        match self.work.tokens.get_mut(&token.id) {
            Some(slot) => {
                *slot = token.clone();
                Ok(())
            }
            None => Err(QueueError::TokenNotFound(token.id)),
        }
    }

    async fn renumber(&mut self, assignments: &[(Uuid, i32)]) -> QueueResult<()> {
        for (id, number) in assignments {
            let token = self
                .work
                .tokens
                .get_mut(id)
                .ok_or(QueueError::TokenNotFound(*id))?;
            token.token_number = *number;
        }
        let mut seen = HashSet::new();
        for t in self.work.tokens.values() {
            if !seen.insert(t.token_number) {
                return Err(QueueError::Conflict {
                    service_id: self.work.service.id,
                    token_number: t.token_number,
                });
            }
        }
        Ok(())
    }

    async fn commit(self) -> QueueResult<()> {
        let MemoryTx {
            mut guard,
            work,
            token_index,
            inserted,
        } = self;
        let service_id = work.service.id;
        *guard = work;
        for id in inserted {
            token_index.insert(id, service_id);
        }
        Ok(())
    }
}

/// Contact records keyed by user id.
#[derive(Clone, Default)]
pub struct MemoryContacts {
    contacts: Arc<DashMap<Uuid, Recipient>>,
}

impl MemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, recipient: Recipient) {
        self.contacts.insert(recipient.user_id, recipient);
    }
}

#[async_trait]
impl ContactDirectory for MemoryContacts {
    async fn recipient(&self, user_id: Uuid) -> anyhow::Result<Option<Recipient>> {
        Ok(self.contacts.get(&user_id).map(|r| r.value().clone()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryNotificationLog {
    rows: Arc<DashMap<Uuid, NotificationLog>>,
}

impl MemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl NotificationLogStore for MemoryNotificationLog {
    async fn create(&self, entry: &NotificationLog) -> anyhow::Result<()> {
        self.rows.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn finish(&self, log_id: Uuid, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        let mut row = self
            .rows
            .get_mut(&log_id)
            .ok_or_else(|| anyhow::anyhow!("notification log {} not found", log_id))?;
        row.success = outcome.success;
        row.provider_id = outcome.provider_id.clone();
        row.details = Some(outcome.details.clone());
        row.sent_at = outcome.finished_at;
        Ok(())
    }

    async fn get(&self, log_id: Uuid) -> anyhow::Result<Option<NotificationLog>> {
        Ok(self.rows.get(&log_id).map(|r| r.value().clone()))
    }
}
