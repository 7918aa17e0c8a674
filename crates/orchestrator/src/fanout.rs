//! Per-session connection sets and outbound delivery.
//!
//! Every connection owns an unbounded queue drained by its transport task.
//! Queue depth is counted so a slow consumer can be told to drain, and cut
//! off past a hard limit, without ever blocking delivery to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use events::{BackpressureState, EventEnvelope, EventLog, EventPayload, LogError};
use futures::StreamExt;
use serde::Serialize;
use session_core::{ConnectionId, ErrorCode, RunId, RunState, SessionId, SessionState, TranscriptItem};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BackpressureConfig;
use crate::error::OrchestratorError;

/// A frame queued for one connection
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Logged event, shared by every recipient
    Event(Arc<EventEnvelope>),
    /// Connection-scoped event without an `event_id`
    Signal(SignalFrame),
    /// Direct answer to a command
    Reply(ReplyFrame),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(envelope) => envelope.payload.kind(),
            Self::Signal(frame) => frame.payload.kind(),
            Self::Reply(frame) => frame.reply.kind(),
        }
    }

    pub fn event_id(&self) -> Option<u64> {
        match self {
            Self::Event(envelope) => Some(envelope.event_id),
            _ => None,
        }
    }

    pub fn signal(session_id: Option<SessionId>, req_id: Option<String>, payload: EventPayload) -> Self {
        Self::Signal(SignalFrame {
            session_id,
            run_id: None,
            req_id,
            timestamp: Utc::now(),
            payload,
        })
    }

    pub fn reply(session_id: SessionId, req_id: Option<String>, reply: Reply) -> Self {
        Self::Reply(ReplyFrame {
            session_id,
            req_id,
            timestamp: Utc::now(),
            reply,
        })
    }

    /// Connection-scoped `error` frame for a rejected command
    pub fn error(session_id: Option<SessionId>, req_id: Option<String>, error: &OrchestratorError) -> Self {
        Self::signal(
            session_id,
            req_id,
            EventPayload::Error {
                code: error.code(),
                message: Some(error.to_string()),
                details: error.details(),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalFrame {
    pub session_id: Option<SessionId>,
    pub run_id: Option<RunId>,
    pub req_id: Option<String>,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyFrame {
    pub session_id: SessionId,
    pub req_id: Option<String>,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub reply: Reply,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Welcome {
        v: String,
        session_state: SessionState,
    },
    Snapshot {
        v: String,
        session_state: SessionState,
        run_state: Option<RunState>,
        transcript: Vec<TranscriptItem>,
        as_of_event_id: u64,
    },
    Accepted {
        command: &'static str,
        run_id: Option<RunId>,
        duplicate: bool,
    },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Snapshot { .. } => "snapshot",
            Self::Accepted { .. } => "accepted",
        }
    }
}

/// One attached client
pub struct Connection {
    id: ConnectionId,
    session_id: Mutex<Option<SessionId>>,
    tx: mpsc::UnboundedSender<Outbound>,
    depth: AtomicUsize,
    draining: AtomicBool,
    closed: CancellationToken,
    config: BackpressureConfig,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn bind(&self, session_id: Option<SessionId>) {
        *self.session_id.lock().unwrap_or_else(|p| p.into_inner()) = session_id;
    }

    /// Frames queued but not yet taken by the transport
    pub fn queued(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from the server side
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(connection_id = %self.id, "Closing connection");
            self.closed.cancel();
        }
    }

    /// Queue a frame. Returns `false` once the connection is closed.
    pub fn send(&self, frame: Outbound) -> bool {
        if !self.enqueue(frame) {
            return false;
        }

        let depth = self.queued();
        if depth > self.config.high_water && !self.draining.swap(true, Ordering::AcqRel) {
            warn!(connection_id = %self.id, depth, "Connection is slow, asking client to drain");
            self.enqueue(self.backpressure(BackpressureState::Drain));
        }
        true
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }

        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > self.config.hard_limit {
            warn!(connection_id = %self.id, depth, "Outbound queue over hard limit, disconnecting");
            self.close();
            return false;
        }
        if self.tx.send(frame).is_err() {
            self.close();
            return false;
        }
        true
    }

    fn backpressure(&self, state: BackpressureState) -> Outbound {
        Outbound::signal(self.session_id(), None, EventPayload::Backpressure { state })
    }

    fn on_dequeued(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if depth <= self.config.low_water && self.draining.swap(false, Ordering::AcqRel) {
            debug!(connection_id = %self.id, depth, "Connection caught up");
            self.enqueue(self.backpressure(BackpressureState::Ok));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id())
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Transport side of a connection's queue
pub struct ConnectionReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
    conn: Arc<Connection>,
}

impl ConnectionReceiver {
    /// Next frame, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.conn.closed.cancelled() => None,
            frame = self.rx.recv() => {
                let frame = frame?;
                self.conn.on_dequeued();
                Some(frame)
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if self.conn.is_closed() {
            return None;
        }
        let frame = self.rx.try_recv().ok()?;
        self.conn.on_dequeued();
        Some(frame)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

/// How an attach caught the connection up
#[derive(Debug)]
pub enum ReplayOutcome {
    /// No resume point was given
    Fresh,
    Replayed(usize),
    /// The gap cannot be replayed; the client must fetch a snapshot.
    SnapshotRequired(LogError),
}

/// Connections attached to each session
pub struct ConnectionFanout {
    sessions: RwLock<HashMap<SessionId, HashMap<ConnectionId, Arc<Connection>>>>,
    config: BackpressureConfig,
}

impl ConnectionFanout {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// New unattached connection and the receiver its transport drains
    pub fn connect(&self) -> (Arc<Connection>, ConnectionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id: ConnectionId::generate(),
            session_id: Mutex::new(None),
            tx,
            depth: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            closed: CancellationToken::new(),
            config: self.config,
        });
        let receiver = ConnectionReceiver {
            rx,
            conn: Arc::clone(&conn),
        };
        (conn, receiver)
    }

    /// Catch the connection up from `last_seen_event_id`, then register it
    /// for live broadcast.
    ///
    /// Must be called while the session's events are quiescent (under the
    /// session lock) so nothing is appended between replay and registration.
    /// A gap that cannot be replayed still registers the connection.
    pub async fn attach(
        &self,
        session_id: &SessionId,
        conn: &Arc<Connection>,
        last_seen_event_id: Option<u64>,
        log: &dyn EventLog,
    ) -> Result<ReplayOutcome, LogError> {
        let outcome = match last_seen_event_id {
            None => ReplayOutcome::Fresh,
            Some(from) => match Self::replay_to(session_id, conn, from, log).await {
                Ok(count) => ReplayOutcome::Replayed(count),
                Err(e) if e.requires_snapshot() => ReplayOutcome::SnapshotRequired(e),
                Err(e) => return Err(e),
            },
        };

        self.register(session_id, conn);
        Ok(outcome)
    }

    async fn replay_to(
        session_id: &SessionId,
        conn: &Connection,
        from: u64,
        log: &dyn EventLog,
    ) -> Result<usize, LogError> {
        let mut stream = log.replay(session_id, from).await?;
        let mut count = 0;
        while let Some(envelope) = stream.next().await {
            if !conn.send(Outbound::Event(Arc::new(envelope?))) {
                break;
            }
            count += 1;
        }
        debug!(session_id = %session_id, connection_id = %conn.id(), from, count, "Replayed events");
        Ok(count)
    }

    fn register(&self, session_id: &SessionId, conn: &Arc<Connection>) {
        if conn
            .session_id()
            .is_some_and(|current| &current != session_id)
        {
            self.detach(conn);
        }
        conn.bind(Some(session_id.clone()));
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(session_id.clone())
            .or_default()
            .insert(conn.id(), Arc::clone(conn));
    }

    fn connections(&self, session_id: &SessionId) -> Vec<Arc<Connection>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver a logged event to every attached connection. Returns how many
    /// accepted it; connections that failed are detached.
    pub fn broadcast(&self, envelope: EventEnvelope) -> usize {
        let session_id = envelope.session_id.clone();
        self.deliver(&session_id, Outbound::Event(Arc::new(envelope)))
    }

    /// Deliver a connection-scoped frame to every attached connection
    pub fn signal(&self, session_id: &SessionId, run_id: Option<RunId>, payload: EventPayload) -> usize {
        let frame = Outbound::Signal(SignalFrame {
            session_id: Some(session_id.clone()),
            run_id,
            req_id: None,
            timestamp: Utc::now(),
            payload,
        });
        self.deliver(session_id, frame)
    }

    fn deliver(&self, session_id: &SessionId, frame: Outbound) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in self.connections(session_id) {
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                failed.push(conn);
            }
        }
        for conn in failed {
            warn!(session_id = %session_id, connection_id = %conn.id(), "Dropping unreachable connection");
            self.detach(&conn);
        }
        delivered
    }

    /// Remove a connection from its session. Idempotent.
    pub fn detach(&self, conn: &Connection) -> bool {
        let Some(session_id) = conn.session_id() else {
            return false;
        };
        conn.bind(None);

        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        let Some(conns) = sessions.get_mut(&session_id) else {
            return false;
        };
        let removed = conns.remove(&conn.id()).is_some();
        if conns.is_empty() {
            sessions.remove(&session_id);
        }
        removed
    }

    /// Detach and close every connection of a session
    pub fn detach_session(&self, session_id: &SessionId) -> usize {
        let conns = self
            .sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id)
            .unwrap_or_default();
        for conn in conns.values() {
            conn.bind(None);
            conn.close();
        }
        conns.len()
    }

    pub fn count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }
}

impl Default for ConnectionFanout {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

/// Unlogged `error` frame sent to every connection of a failed session
pub(crate) fn internal_error(message: impl Into<String>) -> EventPayload {
    EventPayload::Error {
        code: ErrorCode::Internal,
        message: Some(message.into()),
        details: None,
    }
}
