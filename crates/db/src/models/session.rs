use chrono::{DateTime, TimeZone, Utc};
use events::SessionSnapshot;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_id: String,
    pub version: String,
    pub capabilities: String,
    pub snapshot: String,
    pub next_event_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRow {
    pub fn snapshot(&self) -> Result<SessionSnapshot, DbError> {
        Ok(serde_json::from_str(&self.snapshot)?)
    }

    pub fn last_event_id(&self) -> u64 {
        (self.next_event_id - 1).max(0) as u64
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.created_at)
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}
