//! In-process event log with a bounded retention window

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use session_core::{RunId, SessionId};

use crate::log::{check_replay_range, EventLog, LogConfig, LogError, ReplayStream, Result, SessionMeta};
use crate::snapshot::SessionSnapshot;
use crate::types::{EventEnvelope, EventPayload};

struct SessionLog {
    events: VecDeque<EventEnvelope>,
    next_event_id: u64,
    snapshot: SessionSnapshot,
}

impl SessionLog {
    fn new(session_id: SessionId, meta: &SessionMeta) -> Self {
        Self {
            events: VecDeque::with_capacity(64),
            next_event_id: 1,
            snapshot: SessionSnapshot::empty(session_id, meta),
        }
    }

    fn last_event_id(&self) -> u64 {
        self.next_event_id - 1
    }

    fn oldest_retained(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.event_id)
            .unwrap_or(self.next_event_id)
    }
}

/// Reads one retained event per step, bounded by the last id at the time
/// replay was requested.
struct ReplayCursor {
    log: Arc<Mutex<SessionLog>>,
    cursor: u64,
    last: u64,
}

impl ReplayCursor {
    fn next(&mut self) -> Option<Result<EventEnvelope>> {
        if self.cursor >= self.last {
            return None;
        }

        let log = self.log.lock().unwrap_or_else(|p| p.into_inner());
        let expected = self.cursor + 1;
        let oldest = log.oldest_retained();
        if oldest > expected {
            // Retention dropped events after the range check
            let requested = self.cursor;
            self.cursor = self.last;
            return Some(Err(LogError::WindowExceeded {
                requested,
                oldest_retained: oldest,
            }));
        }

        let index = usize::try_from(expected - oldest).ok()?;
        let envelope = log.events.get(index)?.clone();
        self.cursor = expected;
        Some(Ok(envelope))
    }
}

/// Event log kept entirely in memory.
///
/// Sessions live until `remove` is called. Only the most recent
/// `retention_window` events of each session are kept for replay.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Mutex<SessionLog>>>>>,
    config: LogConfig,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LogConfig) -> Self {
        Self {
            sessions: Arc::default(),
            config,
        }
    }

    fn session(&self, session_id: &SessionId) -> Result<Arc<Mutex<SessionLog>>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| LogError::SessionNotFound(session_id.clone()))
    }

    /// Number of events currently retained for a session
    pub fn retained_len(&self, session_id: &SessionId) -> usize {
        self.session(session_id)
            .map(|log| log.lock().unwrap_or_else(|p| p.into_inner()).events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn open(&self, session_id: &SessionId, meta: SessionMeta) -> Result<SessionSnapshot> {
        if let Ok(log) = self.session(session_id) {
            return Ok(log.lock().unwrap_or_else(|p| p.into_inner()).snapshot.clone());
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        let log = sessions.entry(session_id.clone()).or_insert_with(|| {
            tracing::debug!(session_id = %session_id, "Opened in-memory session log");
            Arc::new(Mutex::new(SessionLog::new(session_id.clone(), &meta)))
        });
        let snapshot = log.lock().unwrap_or_else(|p| p.into_inner()).snapshot.clone();
        Ok(snapshot)
    }

    async fn append(
        &self,
        session_id: &SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<EventEnvelope> {
        if !payload.is_loggable() {
            return Err(LogError::NotLoggable(payload.kind()));
        }

        let log = self.session(session_id)?;
        let mut log = log.lock().unwrap_or_else(|p| p.into_inner());

        let envelope = EventEnvelope::new(log.next_event_id, session_id.clone(), run_id, payload);
        log.next_event_id += 1;
        log.snapshot.apply(&envelope, self.config.transcript_window);
        log.events.push_back(envelope.clone());

        while log.events.len() > self.config.retention_window {
            log.events.pop_front();
        }

        Ok(envelope)
    }

    async fn replay(&self, session_id: &SessionId, from_event_id: u64) -> Result<ReplayStream> {
        let session = self.session(session_id)?;
        let log = session.lock().unwrap_or_else(|p| p.into_inner());

        check_replay_range(from_event_id, log.oldest_retained(), log.last_event_id())?;

        let cursor = ReplayCursor {
            cursor: from_event_id,
            last: log.last_event_id(),
            log: Arc::clone(&session),
        };
        drop(log);
        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next()?;
            Some((item, cursor))
        })
        .boxed())
    }

    async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        let log = self.session(session_id)?;
        let snapshot = log.lock().unwrap_or_else(|p| p.into_inner()).snapshot.clone();
        Ok(snapshot)
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self
            .sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id)
            .is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl std::fmt::Debug for MemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.sessions.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("MemoryEventLog")
            .field("sessions", &sessions)
            .field("config", &self.config)
            .finish()
    }
}
