//! Durable event log over SQLite

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use events::{
    check_replay_range, EventEnvelope, EventLog, EventPayload, LogConfig, LogError, ReplayStream,
    SessionMeta, SessionSnapshot,
};
use futures::StreamExt;
use session_core::{RunId, SessionId};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::models::EventRow;
use crate::pool::{create_pool, run_migrations};
use crate::repositories::{EventRepository, SessionRepository};

const REPLAY_PAGE_SIZE: i64 = 256;

/// [`EventLog`] persisted in SQLite.
///
/// Each append runs in one transaction that inserts the event, stores the
/// updated snapshot and drops events that fell out of the retention window.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
    sessions: SessionRepository,
    events: EventRepository,
    config: LogConfig,
    /// Serializes appends so id assignment never races across connections.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteEventLog {
    pub fn new(pool: SqlitePool, config: LogConfig) -> Self {
        Self {
            sessions: SessionRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            pool,
            config,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the database at `database_url` and bring its schema up to date.
    pub async fn connect(database_url: &str, config: LogConfig) -> Result<Self, DbError> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        tracing::info!(database_url = %database_url, "Event log database ready");
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn retained_len(&self, session_id: &SessionId) -> Result<i64, DbError> {
        self.events.count_by_session_id(session_id.as_str()).await
    }

    async fn append_inner(
        &self,
        session_id: &SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<EventEnvelope, DbError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT snapshot, next_event_id FROM sessions WHERE session_id = ?")
                .bind(session_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((snapshot_json, next_event_id)) = row else {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        };

        let mut snapshot: SessionSnapshot = serde_json::from_str(&snapshot_json)?;
        let envelope =
            EventEnvelope::new(next_event_id as u64, session_id.clone(), run_id, payload);
        snapshot.apply(&envelope, self.config.transcript_window);

        EventRepository::insert(&mut *tx, &EventRow::try_from(&envelope)?).await?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET snapshot = ?, next_event_id = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(serde_json::to_string(&snapshot)?)
        .bind(next_event_id + 1)
        .bind(envelope.timestamp.timestamp())
        .bind(session_id.as_str())
        .execute(&mut *tx)
        .await?;

        let keep_from = next_event_id + 1 - self.config.retention_window as i64;
        if keep_from > 1 {
            EventRepository::delete_before(&mut *tx, session_id.as_str(), keep_from).await?;
        }

        tx.commit().await?;
        Ok(envelope)
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn open(&self, session_id: &SessionId, meta: SessionMeta) -> Result<SessionSnapshot, LogError> {
        let empty = SessionSnapshot::empty(session_id.clone(), &meta);
        let created = self
            .sessions
            .create_if_missing(session_id.as_str(), &meta.version, &meta.capabilities, &empty)
            .await?;
        if created {
            tracing::debug!(session_id = %session_id, "Created persisted session");
            return Ok(empty);
        }
        self.snapshot(session_id).await
    }

    async fn append(
        &self,
        session_id: &SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<EventEnvelope, LogError> {
        if !payload.is_loggable() {
            return Err(LogError::NotLoggable(payload.kind()));
        }

        self.append_inner(session_id, run_id, payload)
            .await
            .map_err(|e| {
                let error = LogError::from(e);
                if error.is_storage_failure() {
                    tracing::error!(session_id = %session_id, error = %error, "Failed to append event");
                }
                error
            })
    }

    async fn replay(&self, session_id: &SessionId, from_event_id: u64) -> Result<ReplayStream, LogError> {
        let session = self
            .sessions
            .find_by_id(session_id.as_str())
            .await?
            .ok_or_else(|| LogError::SessionNotFound(session_id.clone()))?;
        let last = session.last_event_id();
        let oldest = self
            .events
            .oldest_event_id(session_id.as_str())
            .await?
            .map(|id| id as u64)
            .unwrap_or(last + 1);

        check_replay_range(from_event_id, oldest, last)?;

        let state = ReplayCursor {
            events: self.events.clone(),
            session_id: session_id.clone(),
            cursor: from_event_id,
            last,
            buffer: VecDeque::new(),
            done: from_event_id >= last,
        };
        Ok(futures::stream::unfold(state, ReplayCursor::next).boxed())
    }

    async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, LogError> {
        let row = self
            .sessions
            .find_by_id(session_id.as_str())
            .await?
            .ok_or_else(|| LogError::SessionNotFound(session_id.clone()))?;
        Ok(row.snapshot()?)
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, LogError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.sessions.delete(session_id.as_str()).await?)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, LogError> {
        let ids = self.sessions.list_ids().await?;
        Ok(ids.into_iter().map(SessionId::new).collect())
    }
}

/// Page-at-a-time reader over the events table.
///
/// Bounded by the last id at the time replay was requested, so the
/// sequence is finite even while appends continue.
struct ReplayCursor {
    events: EventRepository,
    session_id: SessionId,
    cursor: u64,
    last: u64,
    buffer: VecDeque<EventRow>,
    done: bool,
}

impl ReplayCursor {
    async fn next(mut self) -> Option<(Result<EventEnvelope, LogError>, Self)> {
        if self.done {
            return None;
        }

        if self.buffer.is_empty() {
            match self
                .events
                .find_page(self.session_id.as_str(), self.cursor as i64, REPLAY_PAGE_SIZE)
                .await
            {
                Ok(rows) => self.buffer.extend(rows),
                Err(e) => {
                    self.done = true;
                    return Some((Err(e.into()), self));
                }
            }
        }

        let expected = self.cursor + 1;
        let Some(row) = self.buffer.pop_front() else {
            // Session removed mid-replay
            self.done = true;
            return Some((Err(LogError::SessionNotFound(self.session_id.clone())), self));
        };

        if row.event_id as u64 != expected {
            // Retention dropped rows after the range check
            self.done = true;
            return Some((
                Err(LogError::WindowExceeded {
                    requested: self.cursor,
                    oldest_retained: row.event_id as u64,
                }),
                self,
            ));
        }

        self.cursor = expected;
        self.done = self.cursor >= self.last;
        let item = row.into_domain().map_err(LogError::from);
        Some((item, self))
    }
}
