use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{ContactDirectory, NotificationLogStore, QueueStore, QueueTx};
use crate::errors::{QueueError, QueueResult};
use crate::models::notification::{DeliveryOutcome, NotificationLog, Recipient};
use crate::models::service::{NewService, Service, StatusCounts};
use crate::models::token::{NewToken, Token, TokenStatus};

const TOKEN_COLUMNS: &str = "id, service_id, user_id, token_number, status, priority_level, \
     counter_number, skip_reason, joined_at, service_start_time, service_end_time, served_at, completed_at";

const SERVICE_COLUMNS: &str = "id, name, service_type, location, num_counters, avg_service_time, \
     last_token_number, paused, created_at";

// SQLSTATEs the caller may retry with backoff.
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const UNIQUE_VIOLATION: &str = "23505";

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.into_owned())
}

/// Map a driver error onto the engine's error kinds.
fn classify(err: sqlx::Error) -> QueueError {
    match sqlstate(&err).as_deref() {
        Some(DEADLOCK_DETECTED) | Some(LOCK_NOT_AVAILABLE) | Some(SERIALIZATION_FAILURE) => {
            tracing::warn!(error = %err, "lock contention aborted transaction");
            return QueueError::Fatal(err.to_string());
        }
        _ => {}
    }
    if matches!(err, sqlx::Error::PoolTimedOut) {
        return QueueError::Fatal("timed out waiting for a database connection".into());
    }
    QueueError::Database(err)
}

trait PgResultExt<T> {
    fn db(self) -> QueueResult<T>;
}

impl<T> PgResultExt<T> for Result<T, sqlx::Error> {
    fn db(self) -> QueueResult<T> {
        self.map_err(classify)
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Catalog Operations --

    pub async fn create_service(&self, new: NewService) -> anyhow::Result<Service> {
        let svc = new.into_service(Uuid::new_v4());
        let row = sqlx::query_as::<_, Service>(&format!(
            r#"INSERT INTO services (id, name, service_type, location, num_counters, avg_service_time)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {SERVICE_COLUMNS}"#
        ))
        .bind(svc.id)
        .bind(&svc.name)
        .bind(&svc.service_type)
        .bind(&svc.location)
        .bind(svc.num_counters)
        .bind(svc.avg_service_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_services(&self) -> anyhow::Result<Vec<Service>> {
        let rows = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_contact(&self, recipient: &Recipient) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO user_contacts (user_id, phone_number, sms_opt_in)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id) DO UPDATE
                 SET phone_number = EXCLUDED.phone_number,
                     sms_opt_in = EXCLUDED.sms_opt_in"#,
        )
        .bind(recipient.user_id)
        .bind(&recipient.phone_number)
        .bind(recipient.sms_opt_in)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Audit Log Operations --

    pub async fn list_audit_logs(&self, service_id: Uuid, limit: i64) -> anyhow::Result<Vec<AuditLogRow>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            r#"SELECT id, actor_id, service_id, target_token_id, action, reason, created_at
               FROM audit_logs
               WHERE service_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(service_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl QueueStore for PgStore {
    type Tx = PgQueueTx;

    async fn lock_service(&self, service_id: Uuid) -> QueueResult<PgQueueTx> {
        let mut tx = self.pool.begin().await.db()?;
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE id = $1 FOR UPDATE"
        ))
        .bind(service_id)
        .fetch_optional(&mut *tx)
        .await
        .db()?
        .ok_or(QueueError::ServiceNotFound(service_id))?;
        Ok(PgQueueTx { tx, service })
    }

    async fn get_service(&self, service_id: Uuid) -> QueueResult<Option<Service>> {
        sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE id = $1"
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await
        .db()
    }

    async fn get_token(&self, token_id: Uuid) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"))
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .db()
    }

    async fn count_waiting_before(&self, service_id: Uuid, token_number: i32) -> QueueResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tokens WHERE service_id = $1 AND status = 'waiting' AND token_number < $2",
        )
        .bind(service_id)
        .bind(token_number)
        .fetch_one(&self.pool)
        .await
        .db()
    }

    async fn current_serving(&self, service_id: Uuid) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 AND status = 'serving' \
             ORDER BY token_number ASC LIMIT 1"
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await
        .db()
    }

    async fn active_tokens(&self, service_id: Uuid) -> QueueResult<Vec<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 \
             AND status IN ('waiting', 'serving') ORDER BY token_number ASC"
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .db()
    }

    async fn status_counts(&self, service_id: Uuid) -> QueueResult<StatusCounts> {
        let rows = sqlx::query_as::<_, (TokenStatus, i64)>(
            "SELECT status, COUNT(*) FROM tokens WHERE service_id = $1 GROUP BY status",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .db()?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status {
                TokenStatus::Waiting => counts.waiting = n,
                TokenStatus::Serving => counts.serving = n,
                TokenStatus::Completed => counts.completed = n,
                TokenStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    async fn tokens_for_user(&self, user_id: Uuid) -> QueueResult<Vec<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE user_id = $1 ORDER BY joined_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .db()
    }
}

/// A Postgres transaction holding `FOR UPDATE` on one service row.
pub struct PgQueueTx {
    tx: Transaction<'static, Postgres>,
    service: Service,
}

#[async_trait]
impl QueueTx for PgQueueTx {
    fn service(&self) -> &Service {
        &self.service
    }

    async fn serving_token(&mut self) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 AND status = 'serving' \
             ORDER BY token_number ASC LIMIT 1 FOR UPDATE"
        ))
        .bind(self.service.id)
        .fetch_optional(&mut *self.tx)
        .await
        .db()
    }

    async fn next_waiting(&mut self) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 AND status = 'waiting' \
             ORDER BY priority_level DESC, token_number ASC LIMIT 1 FOR UPDATE"
        ))
        .bind(self.service.id)
        .fetch_optional(&mut *self.tx)
        .await
        .db()
    }

    async fn waiting_tokens(&mut self) -> QueueResult<Vec<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 AND status = 'waiting' \
             ORDER BY token_number ASC FOR UPDATE"
        ))
        .bind(self.service.id)
        .fetch_all(&mut *self.tx)
        .await
        .db()
    }

    async fn token(&mut self, token_id: Uuid) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1 AND service_id = $2 FOR UPDATE"
        ))
        .bind(token_id)
        .bind(self.service.id)
        .fetch_optional(&mut *self.tx)
        .await
        .db()
    }

    async fn active_token_for_user(&mut self, user_id: Uuid) -> QueueResult<Option<Token>> {
        sqlx::query_as::<_, Token>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE service_id = $1 AND user_id = $2 \
             AND status IN ('waiting', 'serving') ORDER BY token_number ASC LIMIT 1 FOR UPDATE"
        ))
        .bind(self.service.id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .db()
    }

    async fn max_token_number(&mut self) -> QueueResult<i32> {
        sqlx::query_scalar::<_, i32>(
            "SELECT COALESCE(MAX(token_number), 0) FROM tokens WHERE service_id = $1",
        )
        .bind(self.service.id)
        .fetch_one(&mut *self.tx)
        .await
        .db()
    }

    async fn set_last_issued(&mut self, token_number: i32) -> QueueResult<()> {
        sqlx::query("UPDATE services SET last_token_number = $1 WHERE id = $2")
            .bind(token_number)
            .bind(self.service.id)
            .execute(&mut *self.tx)
            .await
            .db()?;
        self.service.last_token_number = token_number;
        Ok(())
    }

    async fn set_paused(&mut self, paused: bool) -> QueueResult<()> {
        sqlx::query("UPDATE services SET paused = $1 WHERE id = $2")
            .bind(paused)
            .bind(self.service.id)
            .execute(&mut *self.tx)
            .await
            .db()?;
        self.service.paused = paused;
        Ok(())
    }

    async fn insert_token(&mut self, token: NewToken) -> QueueResult<Token> {
        let token_number = token.token_number;
        let result = sqlx::query_as::<_, Token>(&format!(
            r#"INSERT INTO tokens (id, service_id, user_id, token_number, status, priority_level, joined_at)
               VALUES ($1, $2, $3, $4, 'waiting', $5, $6)
               RETURNING {TOKEN_COLUMNS}"#
        ))
        .bind(token.id)
        .bind(token.service_id)
        .bind(token.user_id)
        .bind(token.token_number)
        .bind(token.priority_level)
        .bind(token.joined_at)
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(e) if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) => Err(QueueError::Conflict {
                service_id: self.service.id,
                token_number,
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn update_token(&mut self, token: &Token) -> QueueResult<()> {
        let result = sqlx::query(
            r#"UPDATE tokens
               SET status = $1,
                   priority_level = $2,
                   counter_number = $3,
                   skip_reason = $4,
                   service_start_time = $5,
                   service_end_time = $6,
                   served_at = $7,
                   completed_at = $8
               WHERE id = $9 AND service_id = $10"#,
        )
        .bind(token.status)
        .bind(token.priority_level)
        .bind(token.counter_number)
        .bind(&token.skip_reason)
        .bind(token.service_start_time)
        .bind(token.service_end_time)
        .bind(token.served_at)
        .bind(token.completed_at)
        .bind(token.id)
        .bind(self.service.id)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(QueueError::TokenNotFound(token.id)),
            Ok(_) => Ok(()),
            // tokens_one_serving_per_service
            Err(e) if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) => Err(QueueError::State(
                format!("service {} already has a serving token", self.service.id),
            )),
            Err(e) => Err(classify(e)),
        }
    }

    async fn renumber(&mut self, assignments: &[(Uuid, i32)]) -> QueueResult<()> {
        sqlx::query("SET CONSTRAINTS tokens_service_number_key DEFERRED")
            .execute(&mut *self.tx)
            .await
            .db()?;

        for (id, number) in assignments {
            sqlx::query("UPDATE tokens SET token_number = $1 WHERE id = $2 AND service_id = $3")
                .bind(number)
                .bind(id)
                .bind(self.service.id)
                .execute(&mut *self.tx)
                .await
                .db()?;
        }

        // surface collisions here rather than at COMMIT
        let result = sqlx::query("SET CONSTRAINTS tokens_service_number_key IMMEDIATE")
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) => Err(QueueError::Conflict {
                service_id: self.service.id,
                token_number: assignments.first().map(|(_, n)| *n).unwrap_or_default(),
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn commit(self) -> QueueResult<()> {
        self.tx.commit().await.db()
    }
}

#[async_trait]
impl ContactDirectory for PgStore {
    async fn recipient(&self, user_id: Uuid) -> anyhow::Result<Option<Recipient>> {
        let row = sqlx::query_as::<_, Recipient>(
            "SELECT user_id, phone_number, sms_opt_in FROM user_contacts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl NotificationLogStore for PgStore {
    async fn create(&self, entry: &NotificationLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO notification_logs (id, admin_id, token_id, token_number, phone_number, message, sent_at, success)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(entry.id)
        .bind(entry.admin_id)
        .bind(entry.token_id)
        .bind(entry.token_number)
        .bind(&entry.phone_number)
        .bind(&entry.message)
        .bind(entry.sent_at)
        .bind(entry.success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, log_id: Uuid, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE notification_logs
               SET success = $1, provider_id = $2, details = $3, sent_at = $4
               WHERE id = $5"#,
        )
        .bind(outcome.success)
        .bind(&outcome.provider_id)
        .bind(&outcome.details)
        .bind(outcome.finished_at)
        .bind(log_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, log_id: Uuid) -> anyhow::Result<Option<NotificationLog>> {
        let row = sqlx::query_as::<_, NotificationLog>(
            r#"SELECT id, admin_id, token_id, token_number, phone_number, message, sent_at, success, provider_id, details
               FROM notification_logs WHERE id = $1"#,
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

// -- Audit Log Row --

#[derive(Debug, sqlx::FromRow, Serialize, Deserialize)]
pub struct AuditLogRow {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub service_id: Option<Uuid>,
    pub target_token_id: Option<Uuid>,
    pub action: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
