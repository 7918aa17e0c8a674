use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use events::{EventLog, LogError, SessionSnapshot};
use serde::Serialize;
use session_core::{
    ClientCommand, ClientFrame, CoreError, RunId, RunState, RunStatus, SessionId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{OrchestratorError, Result};
use crate::fanout::{Connection, ConnectionFanout, ConnectionReceiver, Outbound};
use crate::policy::ApprovalPolicy;
use crate::session::{Services, Session};
use crate::worker::Worker;

/// Listing entry for one persisted session
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionSummary {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub session_id: SessionId,
    pub last_event_id: Option<u64>,
    pub run_counter: u64,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<u64>))]
    pub active_run_id: Option<RunId>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub run_status: Option<RunStatus>,
    pub connections: usize,
    /// Whether the session currently has in-memory state
    pub loaded: bool,
}

/// Owns every live [`Session`] and routes client frames to them.
pub struct SessionRegistry {
    services: Services,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(
        log: Arc<dyn EventLog>,
        worker: Arc<dyn Worker>,
        policy: Arc<dyn ApprovalPolicy>,
        config: SessionConfig,
    ) -> Self {
        let fanout = Arc::new(ConnectionFanout::new(config.backpressure));
        Self::with_services(Services {
            log,
            fanout,
            worker,
            policy,
            config: Arc::new(config),
        })
    }

    pub fn with_services(services: Services) -> Self {
        Self {
            services,
            sessions: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.services.config
    }

    pub fn fanout(&self) -> &Arc<ConnectionFanout> {
        &self.services.fanout
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.services.log
    }

    /// In-memory session, if loaded
    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn loaded(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Get the session, opening it in the log if it does not exist yet.
    pub async fn get_or_create(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if let Some(session) = self.lookup(session_id) {
            return Ok(session);
        }

        let _creating = self.create_lock.lock().await;
        // Re-check after acquiring the lock
        if let Some(session) = self.lookup(session_id) {
            return Ok(session);
        }

        let session = Session::open(session_id.clone(), self.services.clone()).await?;
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.clone(), Arc::clone(&session));
        info!(session_id = %session_id, "Session loaded");
        Ok(session)
    }

    /// Create a session, generating an id when none is given
    pub async fn create(&self, session_id: Option<SessionId>) -> Result<Arc<Session>> {
        let session_id = session_id.unwrap_or_else(SessionId::generate);
        self.get_or_create(&session_id).await
    }

    /// Get a session that must already exist, rehydrating it from the log
    /// if it was evicted.
    pub async fn lookup_or_load(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if let Some(session) = self.lookup(session_id) {
            return Ok(session);
        }
        match self.services.log.snapshot(session_id).await {
            Ok(_) => self.get_or_create(session_id).await,
            Err(LogError::SessionNotFound(_)) => {
                Err(OrchestratorError::SessionNotFound(session_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        self.lookup_or_load(session_id).await?.snapshot().await
    }

    pub async fn runs(&self, session_id: &SessionId) -> Result<Vec<RunState>> {
        Ok(self.lookup_or_load(session_id).await?.runs().await)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for session_id in self.services.log.list_sessions().await? {
            let snapshot = match self.services.log.snapshot(&session_id).await {
                Ok(snapshot) => snapshot,
                // Destroyed between listing and reading
                Err(LogError::SessionNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let state = snapshot.session_state;
            summaries.push(SessionSummary {
                last_event_id: state.last_event_id,
                run_counter: state.run_counter,
                active_run_id: state.active_run_id,
                run_status: snapshot.run_state.map(|run| run.status),
                connections: self.services.fanout.count(&session_id),
                loaded: self.lookup(&session_id).is_some(),
                session_id,
            });
        }
        Ok(summaries)
    }

    /// Stop the session's run, close its connections and purge its log.
    pub async fn destroy(&self, session_id: &SessionId) -> Result<bool> {
        let _creating = self.create_lock.lock().await;
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        if let Some(session) = &session {
            session.shutdown().await;
        }
        let closed = self.services.fanout.detach_session(session_id);
        let removed = self.services.log.remove(session_id).await?;

        info!(session_id = %session_id, closed, "Session destroyed");
        Ok(removed || session.is_some())
    }

    /// Evict unattached sessions without an active run that have been idle
    /// past the configured TTL. Their logs are kept.
    pub async fn reap_idle(&self) -> usize {
        let ttl = self.services.config.idle_ttl();
        let candidates: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|session| session.connection_count() == 0 && session.idle_for() >= ttl)
            .cloned()
            .collect();

        let mut reaped = 0;
        for session in candidates {
            // Re-checked under the lock: the session may have been attached
            // to or started a run since it was selected
            let _creating = self.create_lock.lock().await;
            if !Self::reapable(&session, ttl).await {
                continue;
            }
            let evicted = self
                .sessions
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(session.id())
                .is_some();
            if !evicted {
                continue;
            }

            session.shutdown().await;
            debug!(session_id = %session.id(), "Evicted idle session");
            reaped += 1;
        }
        if reaped > 0 {
            info!(reaped, "Reaped idle sessions");
        }
        reaped
    }

    async fn reapable(session: &Session, ttl: Duration) -> bool {
        session.connection_count() == 0
            && session.idle_for() >= ttl
            && !session.has_inflight_calls()
            && !session.status().await.is_active()
    }

    /// New connection, not yet attached to any session
    pub fn connect(&self) -> (Arc<Connection>, ConnectionReceiver) {
        self.services.fanout.connect()
    }

    pub fn disconnect(&self, conn: &Connection) {
        if self.services.fanout.detach(conn) {
            debug!(connection_id = %conn.id(), "Connection detached");
        }
        conn.close();
    }

    /// Parse one raw text frame and execute it
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle(conn, frame).await,
            Err(e) => {
                debug!(connection_id = %conn.id(), error = %e, "Rejected client frame");
                conn.send(Outbound::error(
                    conn.session_id(),
                    salvage_req_id(text),
                    &OrchestratorError::from(e),
                ));
            }
        }
    }

    /// Route a command to its session. Rejections are reported to `conn`
    /// only and never logged.
    pub async fn handle(&self, conn: &Arc<Connection>, frame: ClientFrame) {
        let req_id = frame.req_id.clone();
        let command = frame.command.name();

        let (session_id, result) = match self.resolve(conn, &frame).await {
            Ok(session) => {
                let result = session.execute(conn, frame).await;
                (Some(session.id().clone()), result)
            }
            Err(e) => (None, Err(e)),
        };

        if let Err(e) = result {
            let session_id = session_id.or_else(|| conn.session_id());
            if e.is_rejection() {
                debug!(connection_id = %conn.id(), command, error = %e, "Command rejected");
            } else {
                warn!(connection_id = %conn.id(), command, error = %e, "Command failed");
            }
            conn.send(Outbound::error(session_id, req_id, &e));
        }
    }

    async fn resolve(&self, conn: &Connection, frame: &ClientFrame) -> Result<Arc<Session>> {
        let target = frame.session_id.clone().or_else(|| conn.session_id());

        match (&frame.command, target) {
            (ClientCommand::Hello, Some(session_id)) => self.get_or_create(&session_id).await,
            (ClientCommand::Hello, None) => self.create(None).await,
            (_, Some(session_id)) => self.lookup_or_load(&session_id).await,
            (_, None) => Err(CoreError::MissingField("session_id".to_string()).into()),
        }
    }
}

/// Best-effort `req_id` of a frame that failed to parse
fn salvage_req_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("req_id")?.as_str().map(str::to_string)
}
