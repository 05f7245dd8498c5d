use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minutes per token used when a service has no usable average configured.
pub const DEFAULT_AVG_SERVICE_TIME: i32 = 5;

/// A physical service point (hospital counter group, bank teller row, ...).
///
/// Catalog fields are managed outside the engine. The scheduler only writes
/// `paused` and the issuer only writes `last_token_number`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub service_type: String,
    pub location: String,
    pub num_counters: i32,
    /// Minutes, the unit cost of one token.
    pub avg_service_time: i32,
    /// May lag the real maximum; reconciled on every issuance.
    pub last_token_number: i32,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl Service {
    /// Average minutes per token, falling back to `default` when unset or zero.
    pub fn effective_avg_service_time(&self, default: i32) -> i32 {
        if self.avg_service_time > 0 {
            self.avg_service_time
        } else if default > 0 {
            default
        } else {
            DEFAULT_AVG_SERVICE_TIME
        }
    }
}

/// Catalog input used by tooling and tests to seed a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub service_type: String,
    pub location: String,
    pub num_counters: i32,
    pub avg_service_time: i32,
}

impl NewService {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            service_type: "hospital".to_string(),
            location: String::new(),
            num_counters: 1,
            avg_service_time: DEFAULT_AVG_SERVICE_TIME,
        }
    }

    pub fn with_avg_service_time(mut self, minutes: i32) -> Self {
        self.avg_service_time = minutes;
        self
    }

    pub(crate) fn into_service(self, id: Uuid) -> Service {
        Service {
            id,
            name: self.name,
            service_type: self.service_type,
            location: self.location,
            num_counters: self.num_counters,
            avg_service_time: self.avg_service_time,
            last_token_number: 0,
            paused: false,
            created_at: Utc::now(),
        }
    }
}

/// Per-status token counts for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: i64,
    pub serving: i64,
    pub completed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    /// Tokens still in line or at the counter.
    pub fn in_queue(&self) -> i64 {
        self.waiting + self.serving
    }
}
