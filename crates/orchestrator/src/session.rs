//! Per-session actor.
//!
//! A [`Session`] serializes every state change of one session behind a
//! single async lock: commands from any connection, events from the worker
//! stream, tool admissions from the [`ToolGate`] and the abort grace timer.
//! Each change is appended to the event log and broadcast while the lock is
//! held, so all connections observe one total order.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use events::{EventLog, EventPayload, LogError, SessionMeta, SessionSnapshot};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use session_core::{
    ApprovalBrief, ApprovalDecision, CallId, ClientCommand, ClientFrame, ErrorCode, PolicyDecision,
    RunId, RunState, RunStatus, SessionId,
};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalGateway, InflightGuard, InflightTracker, Resolution};
use crate::config::SessionConfig;
use crate::coordinator::{AbortOutcome, RunCoordinator, StartOutcome};
use crate::error::{OrchestratorError, Result};
use crate::fanout::{internal_error, Connection, ConnectionFanout, Outbound, ReplayOutcome, Reply};
use crate::policy::ApprovalPolicy;
use crate::worker::{RunContext, ToolCall, ToolGate, Worker, WorkerEvent, WorkerOutput};

const INTERRUPTED: &str = "run interrupted by server restart";

/// Shared collaborators every session of a registry uses
#[derive(Clone)]
pub struct Services {
    pub log: Arc<dyn EventLog>,
    pub fanout: Arc<ConnectionFanout>,
    pub worker: Arc<dyn Worker>,
    pub policy: Arc<dyn ApprovalPolicy>,
    pub config: Arc<SessionConfig>,
}

/// How the gate may proceed with a tool call
pub(crate) enum Admission {
    /// ALLOW path: the in-flight bracket is already open
    Execute(InflightGuard),
    /// ASK path: wait for the human decision
    Wait(oneshot::Receiver<Resolution>),
    Denied { abort: bool },
    Cancelled,
}

struct SessionInner {
    coordinator: RunCoordinator,
    gateway: ApprovalGateway,
    /// Set once an append failed; the session refuses all further commands
    failed: Option<String>,
    /// Drive task of the active run
    task: Option<(RunId, AbortHandle)>,
}

pub struct Session {
    id: SessionId,
    services: Services,
    inflight: InflightTracker,
    inner: Mutex<SessionInner>,
    last_active: StdMutex<Instant>,
    this: Weak<Session>,
}

impl Session {
    /// Open (or rehydrate) a session from the log and finalize any run the
    /// log still shows as active.
    pub async fn open(id: SessionId, services: Services) -> Result<Arc<Self>> {
        let meta = SessionMeta {
            version: services.config.protocol_version.clone(),
            capabilities: services.config.capabilities.clone(),
        };
        let snapshot = services.log.open(&id, meta).await?;

        let mut coordinator = RunCoordinator::new(services.config.run_history);
        coordinator.restore(snapshot.session_state.run_counter, snapshot.run_state);

        let inflight = InflightTracker::new();
        let session = Arc::new_cyclic(|this| Session {
            id,
            inner: Mutex::new(SessionInner {
                coordinator,
                gateway: ApprovalGateway::new(inflight.clone()),
                failed: None,
                task: None,
            }),
            inflight,
            services,
            last_active: StdMutex::new(Instant::now()),
            this: this.clone(),
        });

        session.recover().await?;
        Ok(session)
    }

    async fn recover(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(run_id) = inner.coordinator.active_run_id() else {
            return Ok(());
        };

        let state = if inner.coordinator.status() == RunStatus::Aborting {
            inner.coordinator.finish(RunStatus::Aborted, None)?
        } else {
            inner
                .coordinator
                .finish(RunStatus::Error, Some(INTERRUPTED.to_string()))?
        };
        warn!(
            session_id = %self.id,
            run_id = %run_id,
            status = %state.status,
            "Finalized run interrupted by restart"
        );
        self.emit_status(&mut inner, state).await
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn has_inflight_calls(&self) -> bool {
        self.inflight.has_inflight_calls()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.count()
    }

    pub fn connection_count(&self) -> usize {
        self.services.fanout.count(&self.id)
    }

    /// Time since the last command or worker event
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub async fn status(&self) -> RunStatus {
        self.inner.lock().await.coordinator.status()
    }

    pub async fn active_run(&self) -> Option<RunState> {
        self.inner.lock().await.coordinator.active().cloned()
    }

    /// Active run first, then finished runs newest first
    pub async fn runs(&self) -> Vec<RunState> {
        self.inner.lock().await.coordinator.runs()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let _inner = self.inner.lock().await;
        Ok(self.services.log.snapshot(&self.id).await?)
    }

    async fn lock_healthy(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let inner = self.inner.lock().await;
        if let Some(reason) = &inner.failed {
            return Err(OrchestratorError::SessionFailed(reason.clone()));
        }
        Ok(inner)
    }

    /// Execute one client command on behalf of `conn`. Direct replies go to
    /// `conn` only; rejections are returned for the caller to report.
    pub async fn execute(&self, conn: &Arc<Connection>, frame: ClientFrame) -> Result<()> {
        self.touch();
        let ClientFrame {
            req_id, command, ..
        } = frame;

        match command {
            ClientCommand::Hello => self.attach(conn, req_id, None).await,
            ClientCommand::Resume { last_seen_event_id } => {
                self.attach(conn, req_id, Some(last_seen_event_id)).await
            }
            ClientCommand::Send {
                text,
                client_msg_id,
            } => self.send(conn, req_id, text, client_msg_id).await,
            ClientCommand::Approve { call_id } => {
                self.decide(conn, req_id, call_id, ApprovalDecision::Approve)
                    .await
            }
            ClientCommand::Deny { call_id, abort } => {
                let decision = if abort {
                    ApprovalDecision::DenyAbort
                } else {
                    ApprovalDecision::DenyContinue
                };
                self.decide(conn, req_id, call_id, decision).await
            }
            ClientCommand::Abort { run_id } => self.abort(conn, req_id, run_id).await,
            ClientCommand::GetSnapshot => self.get_snapshot(conn, req_id).await,
            ClientCommand::Ping => {
                let inner = self.lock_healthy().await?;
                let run_id = inner.coordinator.active_run_id();
                self.reply(conn, req_id, accepted("ping", run_id, false));
                Ok(())
            }
        }
    }

    /// `hello` / `resume`: welcome, then either a snapshot or a replay of
    /// everything after `last_seen_event_id`, then live events.
    pub async fn attach(
        &self,
        conn: &Arc<Connection>,
        req_id: Option<String>,
        last_seen_event_id: Option<u64>,
    ) -> Result<()> {
        let _inner = self.lock_healthy().await?;
        let snapshot = self.services.log.snapshot(&self.id).await?;

        self.reply(
            conn,
            req_id.clone(),
            Reply::Welcome {
                v: self.services.config.protocol_version.clone(),
                session_state: snapshot.session_state.clone(),
            },
        );
        if last_seen_event_id.is_none() {
            self.reply(conn, req_id.clone(), self.snapshot_reply(snapshot));
        }

        let outcome = self
            .services
            .fanout
            .attach(&self.id, conn, last_seen_event_id, self.services.log.as_ref())
            .await?;
        if let ReplayOutcome::SnapshotRequired(e) = outcome {
            debug!(session_id = %self.id, connection_id = %conn.id(), error = %e, "Resume gap not replayable");
            conn.send(Outbound::error(
                Some(self.id.clone()),
                req_id,
                &OrchestratorError::Log(e),
            ));
        }

        debug!(session_id = %self.id, connection_id = %conn.id(), "Connection attached");
        Ok(())
    }

    async fn get_snapshot(&self, conn: &Connection, req_id: Option<String>) -> Result<()> {
        let _inner = self.lock_healthy().await?;
        let snapshot = self.services.log.snapshot(&self.id).await?;
        self.reply(conn, req_id, self.snapshot_reply(snapshot));
        Ok(())
    }

    fn snapshot_reply(&self, snapshot: SessionSnapshot) -> Reply {
        Reply::Snapshot {
            v: self.services.config.protocol_version.clone(),
            session_state: snapshot.session_state,
            run_state: snapshot.run_state,
            transcript: snapshot.transcript,
            as_of_event_id: snapshot.as_of_event_id,
        }
    }

    async fn send(
        &self,
        conn: &Connection,
        req_id: Option<String>,
        text: String,
        client_msg_id: Option<String>,
    ) -> Result<()> {
        let mut inner = self.lock_healthy().await?;

        let state = match inner.coordinator.start(client_msg_id.as_deref())? {
            StartOutcome::Duplicate(run_id) => {
                debug!(session_id = %self.id, run_id = %run_id, "Duplicate send ignored");
                self.reply(conn, req_id, accepted("send", Some(run_id), true));
                return Ok(());
            }
            StartOutcome::Started(state) => state,
        };
        let run_id = state.run_id;
        inner.gateway.reset();
        info!(session_id = %self.id, run_id = %run_id, "Run started");

        self.emit_status(&mut inner, state).await?;
        self.emit(&mut inner, Some(run_id), EventPayload::UserText { text: text.clone() })
            .await?;
        self.reply(conn, req_id, accepted("send", Some(run_id), false));

        let cancel = inner.coordinator.cancel_token().unwrap_or_default();
        let ctx = RunContext {
            run_id,
            input: text,
            tools: ToolGate::new(self.this.clone(), run_id, cancel.clone()),
            cancel,
        };
        self.spawn_run(&mut inner, ctx);
        Ok(())
    }

    fn spawn_run(&self, inner: &mut SessionInner, ctx: RunContext) {
        let run_id = ctx.run_id;
        let worker = Arc::clone(&self.services.worker);
        let this = self.this.clone();

        let drive = tokio::spawn(Self::drive(this.clone(), run_id, async move {
            worker.start(ctx)
        }));
        inner.task = Some((run_id, drive.abort_handle()));

        tokio::spawn(async move {
            match drive.await {
                Err(e) if e.is_panic() => {
                    if let Some(session) = this.upgrade() {
                        session.on_worker_exit(run_id, "worker panicked").await;
                    }
                }
                _ => {}
            }
        });
    }

    async fn drive<F>(this: Weak<Session>, run_id: RunId, start: F)
    where
        F: std::future::Future<Output = BoxStream<'static, WorkerEvent>>,
    {
        let mut events = start.await;
        while let Some(event) = events.next().await {
            let Some(session) = this.upgrade() else { return };
            let terminal = matches!(event, WorkerEvent::Finished | WorkerEvent::Failed(_));
            if !session.on_worker_event(run_id, event).await || terminal {
                return;
            }
        }
        if let Some(session) = this.upgrade() {
            session
                .on_worker_exit(run_id, "worker stopped without finishing")
                .await;
        }
    }

    /// Returns `false` once the run no longer accepts worker events.
    async fn on_worker_event(&self, run_id: RunId, event: WorkerEvent) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.failed.is_some() || !inner.coordinator.is_current(run_id) {
            debug!(session_id = %self.id, run_id = %run_id, "Ignoring event from inactive run");
            return false;
        }
        self.touch();

        match self.apply_worker_event(&mut inner, run_id, event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %self.id, run_id = %run_id, error = %e, "Failed to apply worker event");
                false
            }
        }
    }

    async fn apply_worker_event(
        &self,
        inner: &mut SessionInner,
        run_id: RunId,
        event: WorkerEvent,
    ) -> Result<()> {
        let aborting = inner.coordinator.status() == RunStatus::Aborting;

        match event {
            WorkerEvent::Started if !aborting => self.mark_running(inner).await,
            WorkerEvent::Output(output) if !aborting => {
                self.mark_running(inner).await?;
                let payload = match output {
                    WorkerOutput::AssistantText(text) => EventPayload::AssistantText { text },
                    WorkerOutput::Reasoning(text) => EventPayload::Reasoning { text },
                };
                self.emit(inner, Some(run_id), payload).await
            }
            WorkerEvent::Started | WorkerEvent::Output(_) => {
                debug!(session_id = %self.id, run_id = %run_id, "Dropping output of aborting run");
                Ok(())
            }
            WorkerEvent::Finished | WorkerEvent::Failed(_) if aborting => {
                self.finalize(inner, RunStatus::Aborted, None).await
            }
            WorkerEvent::Finished => self.complete(inner, run_id).await,
            WorkerEvent::Failed(message) => self.fail(inner, run_id, message).await,
        }
    }

    /// The worker stream ended or its task panicked without a terminal event
    async fn on_worker_exit(&self, run_id: RunId, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.failed.is_some() || !inner.coordinator.is_current(run_id) {
            return;
        }

        let result = if inner.coordinator.status() == RunStatus::Aborting {
            self.finalize(&mut inner, RunStatus::Aborted, None).await
        } else {
            warn!(session_id = %self.id, run_id = %run_id, reason, "Worker exited abnormally");
            self.fail(&mut inner, run_id, reason.to_string()).await
        };
        if let Err(e) = result {
            warn!(session_id = %self.id, run_id = %run_id, error = %e, "Failed to finalize run");
        }
    }

    async fn mark_running(&self, inner: &mut SessionInner) -> Result<()> {
        if let Some(state) = inner.coordinator.mark_running()? {
            self.emit_status(inner, state).await?;
        }
        Ok(())
    }

    async fn complete(&self, inner: &mut SessionInner, run_id: RunId) -> Result<()> {
        // Approvals still pending when the worker finishes are dropped, which
        // takes the run back through `running` before it can finish
        let before = inner.coordinator.status();
        let mut resolved = None;
        for call_id in inner.gateway.cancel_all() {
            resolved = Some(inner.coordinator.resolve_approval(&call_id)?);
        }
        match resolved {
            Some(state) if state.status != before => self.emit_status(inner, state).await?,
            _ => self.mark_running(inner).await?,
        }

        let saw_function_output = inner.coordinator.saw_function_output();
        self.finalize(inner, RunStatus::Finished, None).await?;
        if !saw_function_output {
            self.emit(inner, Some(run_id), EventPayload::TurnDone).await?;
        }
        Ok(())
    }

    async fn fail(&self, inner: &mut SessionInner, run_id: RunId, message: String) -> Result<()> {
        self.emit(
            inner,
            Some(run_id),
            EventPayload::error(ErrorCode::AgentError, message.clone()),
        )
        .await?;
        self.finalize(inner, RunStatus::Error, Some(message)).await
    }

    /// Move the active run to a terminal status and log it
    async fn finalize(
        &self,
        inner: &mut SessionInner,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        inner.gateway.cancel_all();
        let state = inner.coordinator.finish(status, error)?;
        if inner
            .task
            .as_ref()
            .is_some_and(|(task_run, _)| *task_run == state.run_id)
        {
            inner.task = None;
        }
        info!(session_id = %self.id, run_id = %state.run_id, status = %state.status, "Run ended");
        self.emit_status(inner, state).await
    }

    async fn abort(
        &self,
        conn: &Connection,
        req_id: Option<String>,
        requested: Option<RunId>,
    ) -> Result<()> {
        let mut inner = self.lock_healthy().await?;
        let run_id = self.begin_abort(&mut inner, requested).await?;
        self.reply(conn, req_id, accepted("abort", Some(run_id), false));
        Ok(())
    }

    /// Shared by the abort command, `deny_abort` decisions and the policy.
    async fn begin_abort(&self, inner: &mut SessionInner, requested: Option<RunId>) -> Result<RunId> {
        match inner.coordinator.begin_abort(requested)? {
            AbortOutcome::AlreadyAborting(run_id) => Ok(run_id),
            AbortOutcome::Started(state) => {
                let run_id = state.run_id;
                inner.gateway.cancel_all();
                info!(session_id = %self.id, run_id = %run_id, "Aborting run");
                self.emit_status(inner, state).await?;
                self.schedule_force_abort(run_id);
                Ok(run_id)
            }
        }
    }

    fn schedule_force_abort(&self, run_id: RunId) {
        let this = self.this.clone();
        let grace = self.services.config.abort_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(session) = this.upgrade() {
                session.force_abort(run_id).await;
            }
        });
    }

    async fn force_abort(&self, run_id: RunId) {
        let mut inner = self.inner.lock().await;
        if inner.failed.is_some()
            || !inner.coordinator.is_current(run_id)
            || inner.coordinator.status() != RunStatus::Aborting
        {
            return;
        }

        warn!(session_id = %self.id, run_id = %run_id, "Worker ignored abort, forcing finalization");
        if let Some((_, handle)) = inner.task.take() {
            handle.abort();
        }
        if let Err(e) = self.finalize(&mut inner, RunStatus::Aborted, None).await {
            warn!(session_id = %self.id, run_id = %run_id, error = %e, "Failed to finalize aborted run");
        }
    }

    async fn decide(
        &self,
        conn: &Connection,
        req_id: Option<String>,
        call_id: CallId,
        decision: ApprovalDecision,
    ) -> Result<()> {
        let mut inner = self.lock_healthy().await?;
        inner.gateway.decide(&call_id, decision)?;
        let run_id = inner
            .coordinator
            .active_run_id()
            .ok_or(OrchestratorError::NotRunning)?;
        debug!(session_id = %self.id, run_id = %run_id, call_id = %call_id, decision = decision.as_str(), "Approval decided");

        self.emit(
            &mut inner,
            Some(run_id),
            EventPayload::ApprovalDecision {
                call_id: call_id.clone(),
                decision,
            },
        )
        .await?;

        let before = inner.coordinator.status();
        let state = inner.coordinator.resolve_approval(&call_id)?;
        if decision == ApprovalDecision::DenyAbort {
            self.begin_abort(&mut inner, Some(run_id)).await?;
        } else if state.status != before {
            self.emit_status(&mut inner, state).await?;
        }

        let command = if decision.is_approval() { "approve" } else { "deny" };
        self.reply(conn, req_id, accepted(command, Some(run_id), false));
        Ok(())
    }

    /// Log a worker's tool call and decide how it may proceed.
    pub(crate) async fn admit_tool(&self, run_id: RunId, call: &ToolCall) -> Result<Admission> {
        let mut inner = self.lock_healthy().await?;
        if !inner.coordinator.is_current(run_id) {
            return Err(OrchestratorError::StaleRunId {
                requested: run_id,
                active: inner.coordinator.active_run_id(),
            });
        }
        if inner.coordinator.status() == RunStatus::Aborting {
            return Ok(Admission::Cancelled);
        }
        self.touch();
        self.mark_running(&mut inner).await?;

        let tool_call = EventPayload::ToolCall {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        };
        let decision = self.services.policy.evaluate(&call.name, &call.args);
        debug!(
            session_id = %self.id,
            run_id = %run_id,
            call_id = %call.call_id,
            tool = %call.name,
            decision = decision.as_str(),
            "Tool call evaluated"
        );

        match decision {
            PolicyDecision::Allow => {
                let guard = inner.gateway.admit(&call.call_id)?;
                self.emit(&mut inner, Some(run_id), tool_call).await?;
                Ok(Admission::Execute(guard))
            }
            PolicyDecision::Ask => {
                let brief = ApprovalBrief {
                    call_id: call.call_id.clone(),
                    tool_key: call.name.clone(),
                    args: call.args.clone(),
                };
                let receiver = inner.gateway.request(brief.clone())?;
                self.emit(&mut inner, Some(run_id), tool_call).await?;
                self.emit(
                    &mut inner,
                    Some(run_id),
                    EventPayload::ApprovalPending {
                        call_id: brief.call_id.clone(),
                        tool_key: brief.tool_key.clone(),
                        args: brief.args.clone(),
                    },
                )
                .await?;
                let state = inner.coordinator.await_approval(brief)?;
                self.emit_status(&mut inner, state).await?;
                Ok(Admission::Wait(receiver))
            }
            PolicyDecision::DenyContinue => {
                self.emit(&mut inner, Some(run_id), tool_call).await?;
                self.emit(
                    &mut inner,
                    Some(run_id),
                    EventPayload::FunctionCallOutput {
                        call_id: call.call_id.clone(),
                        output: denial("policy"),
                        is_error: true,
                    },
                )
                .await?;
                Ok(Admission::Denied { abort: false })
            }
            PolicyDecision::DenyAbort => {
                self.emit(&mut inner, Some(run_id), tool_call).await?;
                self.begin_abort(&mut inner, Some(run_id)).await?;
                Ok(Admission::Denied { abort: true })
            }
        }
    }

    /// Append a tool's output. Returns `false` when the run moved on and the
    /// output was discarded. `executed` is false for denial notices.
    pub(crate) async fn record_tool_output(
        &self,
        run_id: RunId,
        call_id: &CallId,
        output: Value,
        is_error: bool,
        executed: bool,
    ) -> Result<bool> {
        let mut inner = self.lock_healthy().await?;
        if !inner.coordinator.is_current(run_id) || inner.coordinator.status() == RunStatus::Aborting
        {
            debug!(session_id = %self.id, run_id = %run_id, call_id = %call_id, "Discarding tool output of inactive run");
            return Ok(false);
        }
        self.touch();

        self.emit(
            &mut inner,
            Some(run_id),
            EventPayload::FunctionCallOutput {
                call_id: call_id.clone(),
                output,
                is_error,
            },
        )
        .await?;
        if executed {
            inner.coordinator.note_function_output();
        }
        Ok(true)
    }

    /// Stop the active run without logging; used before the session is
    /// evicted or destroyed.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.gateway.cancel_all();
        if let Some(token) = inner.coordinator.cancel_token() {
            token.cancel();
        }
        if let Some((run_id, handle)) = inner.task.take() {
            debug!(session_id = %self.id, run_id = %run_id, "Stopping worker");
            handle.abort();
        }
    }

    async fn emit_status(&self, inner: &mut SessionInner, run_state: RunState) -> Result<()> {
        let run_id = run_state.run_id;
        self.emit(inner, Some(run_id), EventPayload::RunStatus { run_state })
            .await
    }

    /// Append then broadcast. Callers hold the session lock, which keeps
    /// log order and delivery order identical.
    async fn emit(
        &self,
        inner: &mut SessionInner,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<()> {
        if let Some(reason) = &inner.failed {
            return Err(OrchestratorError::SessionFailed(reason.clone()));
        }

        match self.services.log.append(&self.id, run_id, payload).await {
            Ok(envelope) => {
                self.services.fanout.broadcast(envelope);
                Ok(())
            }
            Err(e) => {
                if e.is_storage_failure() {
                    self.poison(inner, &e);
                }
                Err(e.into())
            }
        }
    }

    fn poison(&self, inner: &mut SessionInner, e: &LogError) {
        error!(session_id = %self.id, error = %e, "Event log append failed, session unavailable");
        let reason = e.to_string();
        inner.failed = Some(reason.clone());
        inner.gateway.cancel_all();
        if let Some((_, handle)) = inner.task.take() {
            handle.abort();
        }

        // Not loggable any more, so attached clients learn the terminal
        // state from a connection-scoped frame
        let run_id = match inner.coordinator.force_error(reason.clone()) {
            Some(run_state) => {
                let run_id = run_state.run_id;
                warn!(session_id = %self.id, run_id = %run_id, "Run forced to error");
                self.services.fanout.signal(
                    &self.id,
                    Some(run_id),
                    EventPayload::RunStatus { run_state },
                );
                Some(run_id)
            }
            None => None,
        };
        self.services
            .fanout
            .signal(&self.id, run_id, internal_error(reason));
    }

    fn reply(&self, conn: &Connection, req_id: Option<String>, reply: Reply) {
        conn.send(Outbound::reply(self.id.clone(), req_id, reply));
    }
}

fn accepted(command: &'static str, run_id: Option<RunId>, duplicate: bool) -> Reply {
    Reply::Accepted {
        command,
        run_id,
        duplicate,
    }
}

/// Output recorded for a call that was denied instead of executed
pub(crate) fn denial(by: &str) -> Value {
    json!({ "error": "denied", "denied_by": by })
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("inflight", &self.inflight.count())
            .finish()
    }
}
