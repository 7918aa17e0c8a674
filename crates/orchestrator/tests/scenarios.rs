use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events::{
    EventEnvelope, EventLog, EventPayload, LogConfig, LogError, MemoryEventLog, ReplayStream,
    SessionMeta, SessionSnapshot,
};
use futures::StreamExt;
use orchestrator::{
    worker_fn, ApprovalPolicy, Connection, ConnectionReceiver, PolicyConfig, RunContext,
    SessionConfig, SessionRegistry, StaticPolicy, ToolCall, ToolOutcome, Worker, WorkerSink,
};
use serde_json::{json, Value};
use session_core::{PolicyDecision, RunId, RunStatus, SessionId};
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(30);

struct Client {
    conn: Arc<Connection>,
    rx: ConnectionReceiver,
}

impl Client {
    async fn connect(registry: &SessionRegistry, session: &str) -> Self {
        let (conn, rx) = registry.connect();
        let mut client = Self { conn, rx };
        client
            .command(registry, json!({"type": "hello", "session_id": session}))
            .await;
        let welcome = client.next().await;
        assert_eq!(welcome["type"], "welcome");
        let snapshot = client.next().await;
        assert_eq!(snapshot["type"], "snapshot");
        client
    }

    async fn command(&mut self, registry: &SessionRegistry, frame: Value) {
        registry.handle_text(&self.conn, &frame.to_string()).await;
    }

    async fn next(&mut self) -> Value {
        let frame = timeout(WAIT, self.rx.recv())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Connection closed");
        serde_json::to_value(frame).expect("Failed to serialize frame")
    }

    /// Frames up to and including the first one matching `label`
    async fn until(&mut self, label: &str) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            let done = describe(&frame) == label;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

/// `type`, with the run status appended for `run_status` frames
fn describe(frame: &Value) -> String {
    let kind = frame["type"].as_str().unwrap_or_default();
    match kind {
        "run_status" => format!("run_status:{}", frame["run_state"]["status"].as_str().unwrap_or_default()),
        "error" => format!("error:{}", frame["code"].as_str().unwrap_or_default()),
        _ => kind.to_string(),
    }
}

fn logged(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter(|frame| frame.get("event_id").is_some())
        .map(describe)
        .collect()
}

fn event_ids(frames: &[Value]) -> Vec<u64> {
    frames
        .iter()
        .filter_map(|frame| frame.get("event_id").and_then(Value::as_u64))
        .collect()
}

fn registry_with(
    worker: impl Worker,
    policy: impl ApprovalPolicy + 'static,
    config: SessionConfig,
) -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(MemoryEventLog::new()),
        Arc::new(worker),
        Arc::new(policy),
        config,
    )
}

fn echo() -> impl Worker {
    worker_fn(|ctx: RunContext, sink: WorkerSink| async move {
        sink.assistant_text(format!("echo: {}", ctx.input)).await;
        Ok(())
    })
}

/// Worker that makes one `shell` call and waits on `release` inside the tool
fn tool_worker(release: Arc<Notify>) -> impl Worker {
    worker_fn(move |ctx: RunContext, sink: WorkerSink| {
        let release = Arc::clone(&release);
        async move {
            sink.started().await;
            let call = ToolCall::new("c1", "shell", json!({"cmd": "ls"}));
            let outcome = ctx
                .tools
                .invoke(call, |args| async move {
                    release.notified().await;
                    Ok(json!({"stdout": "file.txt", "args": args}))
                })
                .await;
            match outcome {
                ToolOutcome::Completed { .. } => sink.assistant_text("listed").await,
                ToolOutcome::Denied { .. } => sink.assistant_text("skipped").await,
                ToolOutcome::Cancelled => {}
                ToolOutcome::Rejected(e) => return Err(e.to_string()),
            }
            Ok(())
        }
    })
}

/// Worker that never finishes and ignores cancellation
fn stubborn() -> impl Worker {
    worker_fn(|_ctx: RunContext, sink: WorkerSink| async move {
        sink.started().await;
        std::future::pending::<()>().await;
        Ok(())
    })
}

/// Memory log whose `fail_at`-th append fails with a storage error
struct FlakyLog {
    inner: MemoryEventLog,
    appends: AtomicUsize,
    fail_at: usize,
}

impl FlakyLog {
    fn new(fail_at: usize) -> Self {
        Self {
            inner: MemoryEventLog::new(),
            appends: AtomicUsize::new(0),
            fail_at,
        }
    }
}

#[async_trait]
impl EventLog for FlakyLog {
    async fn open(&self, session_id: &SessionId, meta: SessionMeta) -> Result<SessionSnapshot, LogError> {
        self.inner.open(session_id, meta).await
    }

    async fn append(
        &self,
        session_id: &SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<EventEnvelope, LogError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(LogError::Storage("disk full".to_string()));
        }
        self.inner.append(session_id, run_id, payload).await
    }

    async fn replay(&self, session_id: &SessionId, from_event_id: u64) -> Result<ReplayStream, LogError> {
        self.inner.replay(session_id, from_event_id).await
    }

    async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, LogError> {
        self.inner.snapshot(session_id).await
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, LogError> {
        self.inner.remove(session_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, LogError> {
        self.inner.list_sessions().await
    }
}

fn ask_everything() -> StaticPolicy {
    StaticPolicy::new(PolicyConfig::default())
}

async fn full_log(registry: &SessionRegistry, session: &str) -> Vec<(u64, EventPayload)> {
    registry
        .log()
        .replay(&SessionId::new(session), 0)
        .await
        .expect("Failed to replay")
        .map(|envelope| {
            let envelope = envelope.expect("Replay failed");
            (envelope.event_id, envelope.payload)
        })
        .collect()
        .await
}

#[tokio::test]
async fn scenario_a_fresh_client_gets_welcome_and_empty_snapshot() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let (conn, mut rx) = registry.connect();

    registry
        .handle_text(&conn, r#"{"type":"hello","session_id":"a","req_id":"r1"}"#)
        .await;

    let welcome = serde_json::to_value(rx.try_recv().expect("No welcome")).unwrap();
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["v"], "1.0.0");
    assert_eq!(welcome["session_id"], "a");
    assert_eq!(welcome["req_id"], "r1");

    let snapshot = serde_json::to_value(rx.try_recv().expect("No snapshot")).unwrap();
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["v"], "1.0.0");
    assert_eq!(snapshot["transcript"], json!([]));
    assert_eq!(snapshot["run_state"], Value::Null);
    assert!(snapshot.get("event_id").is_none());
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn scenario_b_plain_turn() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "b").await;

    client
        .command(&registry, json!({"type": "send", "text": "hi", "req_id": "r1"}))
        .await;
    let frames = client.until("turn_done").await;

    assert_eq!(
        logged(&frames),
        vec![
            "run_status:starting",
            "user_text",
            "run_status:running",
            "assistant_text",
            "run_status:finished",
            "turn_done",
        ]
    );
    let accepted = frames
        .iter()
        .find(|frame| frame["type"] == "accepted")
        .expect("No accepted reply");
    assert_eq!(accepted["req_id"], "r1");
    assert_eq!(accepted["run_id"], 1);
    assert_eq!(accepted["duplicate"], false);

    let text = frames
        .iter()
        .find(|frame| frame["type"] == "assistant_text")
        .expect("No assistant text");
    assert_eq!(text["text"], "echo: hi");
    assert_eq!(text["run_id"], 1);
}

#[tokio::test]
async fn scenario_c_approval_keeps_call_in_flight_until_output() {
    let release = Arc::new(Notify::new());
    let registry = registry_with(
        tool_worker(Arc::clone(&release)),
        ask_everything(),
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "c").await;
    let session = registry.lookup(&SessionId::new("c")).expect("Session not loaded");

    client.command(&registry, json!({"type": "send", "text": "list files"})).await;
    let frames = client.until("run_status:awaiting_approval").await;
    let pending = frames
        .iter()
        .find(|frame| frame["type"] == "approval_pending")
        .expect("No approval_pending");
    assert_eq!(pending["call_id"], "c1");
    assert_eq!(pending["tool_key"], "shell");
    assert!(!session.has_inflight_calls());

    client.command(&registry, json!({"type": "approve", "call_id": "c1"})).await;
    let frames = client.until("approval_decision").await;
    let decision = frames.last().unwrap();
    assert_eq!(decision["call_id"], "c1");
    assert_eq!(decision["decision"], "approve");
    assert!(session.has_inflight_calls());
    assert_eq!(session.inflight_count(), 1);

    release.notify_one();
    let frames = client.until("run_status:finished").await;
    let labels = logged(&frames);
    let output_at = labels
        .iter()
        .position(|label| label == "function_call_output")
        .expect("No function_call_output");
    assert!(output_at < labels.len() - 1);
    assert!(!session.has_inflight_calls());

    let output = frames
        .iter()
        .find(|frame| frame["type"] == "function_call_output")
        .unwrap();
    assert_eq!(output["call_id"], "c1");
    assert_eq!(output["is_error"], false);

    // Runs with function output end without turn_done
    let log = full_log(&registry, "c").await;
    assert!(!log
        .iter()
        .any(|(_, payload)| matches!(payload, EventPayload::TurnDone)));
}

#[tokio::test]
async fn second_decision_is_rejected_without_logging() {
    let release = Arc::new(Notify::new());
    let registry = registry_with(
        tool_worker(Arc::clone(&release)),
        ask_everything(),
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "c2").await;

    client.command(&registry, json!({"type": "send", "text": "go"})).await;
    client.until("run_status:awaiting_approval").await;
    client.command(&registry, json!({"type": "approve", "call_id": "c1"})).await;
    client.until("accepted").await;

    client
        .command(&registry, json!({"type": "deny", "call_id": "c1", "req_id": "again"}))
        .await;
    let error = client.next().await;
    assert_eq!(describe(&error), "error:APPROVAL_CONFLICT");
    assert_eq!(error["req_id"], "again");
    assert!(error.get("event_id").is_none());

    client
        .command(&registry, json!({"type": "approve", "call_id": "nope"}))
        .await;
    assert_eq!(describe(&client.next().await), "error:UNKNOWN_CALL_ID");

    release.notify_one();
    client.until("run_status:finished").await;
}

#[tokio::test]
async fn deny_continue_records_denial_and_resumes() {
    let release = Arc::new(Notify::new());
    let registry = registry_with(
        tool_worker(Arc::clone(&release)),
        ask_everything(),
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "deny").await;

    client.command(&registry, json!({"type": "send", "text": "go"})).await;
    client.until("run_status:awaiting_approval").await;
    client.command(&registry, json!({"type": "deny", "call_id": "c1"})).await;
    let frames = client.until("run_status:finished").await;

    assert_eq!(
        logged(&frames),
        vec![
            "approval_decision",
            "run_status:running",
            "function_call_output",
            "assistant_text",
            "run_status:finished",
        ]
    );
    let output = frames
        .iter()
        .find(|frame| frame["type"] == "function_call_output")
        .unwrap();
    assert_eq!(output["is_error"], true);
    assert_eq!(frames[0]["decision"], "deny_continue");

    // the tool never ran, so the turn still closes with turn_done
    assert_eq!(describe(&client.next().await), "turn_done");
    let session = registry.lookup(&SessionId::new("deny")).unwrap();
    assert_eq!(session.inflight_count(), 0);
}

#[tokio::test]
async fn deny_abort_aborts_the_run() {
    let release = Arc::new(Notify::new());
    let registry = registry_with(
        tool_worker(Arc::clone(&release)),
        ask_everything(),
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "deny-abort").await;

    client.command(&registry, json!({"type": "send", "text": "go"})).await;
    client.until("run_status:awaiting_approval").await;
    client
        .command(&registry, json!({"type": "deny", "call_id": "c1", "abort": true}))
        .await;
    let frames = client.until("run_status:aborted").await;

    assert_eq!(
        logged(&frames),
        vec![
            "approval_decision",
            "run_status:aborting",
            "run_status:aborted",
        ]
    );
    assert_eq!(frames[0]["decision"], "deny_abort");
}

#[tokio::test]
async fn policy_denials_never_execute() {
    let release = Arc::new(Notify::new());
    let policy = |tool: &str, _args: &Value| {
        if tool == "shell" {
            PolicyDecision::DenyAbort
        } else {
            PolicyDecision::Allow
        }
    };
    let registry = registry_with(
        tool_worker(Arc::clone(&release)),
        policy,
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "policy").await;

    client.command(&registry, json!({"type": "send", "text": "go"})).await;
    let frames = client.until("run_status:aborted").await;

    let labels = logged(&frames);
    assert!(labels.contains(&"tool_call".to_string()));
    assert!(!labels.contains(&"approval_pending".to_string()));
    assert!(!labels.contains(&"function_call_output".to_string()));
    assert_eq!(labels[labels.len() - 2], "run_status:aborting");
}

#[tokio::test]
async fn allow_and_ask_paths_bracket_execution_identically() {
    for policy in [PolicyDecision::Allow, PolicyDecision::Ask] {
        let release = Arc::new(Notify::new());
        let registry = registry_with(
            tool_worker(Arc::clone(&release)),
            StaticPolicy::new(PolicyConfig {
                default: policy,
                ..PolicyConfig::default()
            }),
            SessionConfig::default(),
        );
        let mut client = Client::connect(&registry, "bracket").await;
        let session = registry.lookup(&SessionId::new("bracket")).unwrap();
        let before = session.inflight_count();

        client.command(&registry, json!({"type": "send", "text": "go"})).await;
        if policy == PolicyDecision::Ask {
            client.until("run_status:awaiting_approval").await;
            client.command(&registry, json!({"type": "approve", "call_id": "c1"})).await;
            client.until("approval_decision").await;
        } else {
            client.until("tool_call").await;
        }
        assert_eq!(session.inflight_count(), before + 1, "{:?}", policy);

        release.notify_one();
        client.until("run_status:finished").await;
        assert_eq!(session.inflight_count(), before, "{:?}", policy);
    }
}

#[tokio::test]
async fn failing_tool_still_releases_bracket() {
    let worker = worker_fn(|ctx: RunContext, _sink: WorkerSink| async move {
        let outcome = ctx
            .tools
            .invoke(ToolCall::new("c1", "shell", json!({})), |_| async {
                Err("exit status 1".to_string())
            })
            .await;
        match outcome {
            ToolOutcome::Completed { is_error: true, .. } => Ok(()),
            other => Err(format!("unexpected outcome: {:?}", other)),
        }
    });
    let registry = registry_with(worker, StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "fail").await;

    client.command(&registry, json!({"type": "send", "text": "go"})).await;
    let frames = client.until("run_status:finished").await;

    let output = frames
        .iter()
        .find(|frame| frame["type"] == "function_call_output")
        .expect("No function_call_output");
    assert_eq!(output["is_error"], true);
    assert_eq!(output["output"]["error"], "exit status 1");
    assert!(!registry
        .lookup(&SessionId::new("fail"))
        .unwrap()
        .has_inflight_calls());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_abort_is_forced_after_grace_period() {
    let config = SessionConfig {
        abort_grace_ms: 5000,
        ..SessionConfig::default()
    };
    let registry = registry_with(stubborn(), StaticPolicy::allow_all(), config);
    let mut client = Client::connect(&registry, "d").await;

    client.command(&registry, json!({"type": "send", "text": "loop"})).await;
    client.until("run_status:running").await;

    let requested = Instant::now();
    client.command(&registry, json!({"type": "abort"})).await;
    let frames = client.until("run_status:aborted").await;

    assert_eq!(
        logged(&frames),
        vec!["run_status:aborting", "run_status:aborted"]
    );
    let elapsed = requested.elapsed();
    assert!(elapsed >= Duration::from_millis(5000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(6000), "{:?}", elapsed);

    let aborted = frames.last().unwrap();
    assert!(aborted["run_state"]["finished_at"].is_string());

    // a new run can start right away
    client.command(&registry, json!({"type": "send", "text": "again"})).await;
    let frames = client.until("run_status:starting").await;
    assert_eq!(frames.last().unwrap()["run_id"], 2);
}

#[tokio::test(start_paused = true)]
async fn cooperative_worker_aborts_before_grace_period() {
    let worker = worker_fn(|ctx: RunContext, sink: WorkerSink| async move {
        sink.started().await;
        ctx.cancel.cancelled().await;
        Ok(())
    });
    let registry = registry_with(worker, StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "coop").await;

    client.command(&registry, json!({"type": "send", "text": "wait"})).await;
    client.until("run_status:running").await;

    let requested = Instant::now();
    client
        .command(&registry, json!({"type": "abort", "run_id": 1}))
        .await;
    client.until("run_status:aborted").await;
    assert!(requested.elapsed() < Duration::from_millis(5000));
}

#[tokio::test]
async fn abort_rejections() {
    let registry = registry_with(stubborn(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "abort").await;

    client.command(&registry, json!({"type": "abort"})).await;
    assert_eq!(describe(&client.next().await), "error:NOT_RUNNING");

    client.command(&registry, json!({"type": "send", "text": "x"})).await;
    client.until("run_status:running").await;
    client
        .command(&registry, json!({"type": "abort", "run_id": 7}))
        .await;
    let error = client.next().await;
    assert_eq!(describe(&error), "error:STALE_RUN_ID");
    assert_eq!(error["details"]["active_run_id"], 1);

    let session = registry.lookup(&SessionId::new("abort")).unwrap();
    assert_eq!(session.status().await, session_core::RunStatus::Running);
}

#[tokio::test]
async fn scenario_e_every_client_sees_every_event_once_in_order() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut first = Client::connect(&registry, "e").await;
    let mut second = Client::connect(&registry, "e").await;

    first.command(&registry, json!({"type": "send", "text": "one"})).await;
    let seen_first = first.until("turn_done").await;
    let seen_second = second.until("turn_done").await;

    let first_ids = event_ids(&seen_first);
    let second_ids = event_ids(&seen_second);
    assert_eq!(first_ids, second_ids);
    assert_eq!(first_ids, (1..=first_ids.len() as u64).collect::<Vec<_>>());

    // the accepted reply goes to the sender only
    assert!(seen_first.iter().any(|frame| frame["type"] == "accepted"));
    assert!(!seen_second.iter().any(|frame| frame["type"] == "accepted"));
}

#[tokio::test]
async fn send_while_active_is_busy() {
    let registry = registry_with(stubborn(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "busy").await;

    client.command(&registry, json!({"type": "send", "text": "first"})).await;
    client.until("run_status:running").await;
    let before = full_log(&registry, "busy").await.len();

    client
        .command(&registry, json!({"type": "send", "text": "second", "req_id": "r2"}))
        .await;
    let error = client.next().await;
    assert_eq!(describe(&error), "error:BUSY");
    assert_eq!(error["req_id"], "r2");

    assert_eq!(full_log(&registry, "busy").await.len(), before);
    let snapshot = registry.snapshot(&SessionId::new("busy")).await.unwrap();
    assert_eq!(snapshot.session_state.run_counter, 1);
}

#[tokio::test]
async fn resent_client_msg_id_is_deduplicated() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "dedup").await;

    let send = json!({"type": "send", "text": "hi", "client_msg_id": "m1"});
    client.command(&registry, send.clone()).await;
    client.until("turn_done").await;
    let before = full_log(&registry, "dedup").await;

    client.command(&registry, send).await;
    let reply = client.next().await;
    assert_eq!(reply["type"], "accepted");
    assert_eq!(reply["duplicate"], true);
    assert_eq!(reply["run_id"], 1);
    assert_eq!(full_log(&registry, "dedup").await, before);
}

#[tokio::test]
async fn event_ids_are_gap_free_across_runs() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "ids").await;

    for text in ["one", "two", "three"] {
        client.command(&registry, json!({"type": "send", "text": text})).await;
        client.until("turn_done").await;
    }

    let ids: Vec<u64> = full_log(&registry, "ids").await.into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
    assert_eq!(ids.len(), 18);
}

#[tokio::test]
async fn resume_replays_identically() {
    let registry = registry_with(echo(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "resume").await;
    client.command(&registry, json!({"type": "send", "text": "hi"})).await;
    client.until("turn_done").await;

    let mut replays = Vec::new();
    for _ in 0..2 {
        let (conn, mut rx) = registry.connect();
        registry
            .handle_text(
                &conn,
                r#"{"type":"resume","session_id":"resume","last_seen_event_id":2}"#,
            )
            .await;
        let frames: Vec<Value> = std::iter::from_fn(|| rx.try_recv())
            .map(|frame| serde_json::to_value(frame).unwrap())
            .collect();
        assert_eq!(frames[0]["type"], "welcome");
        replays.push(
            frames[1..]
                .iter()
                .map(|frame| (frame["event_id"].clone(), frame["type"].clone()))
                .collect::<Vec<_>>(),
        );
    }

    assert_eq!(replays[0], replays[1]);
    assert_eq!(replays[0].first().unwrap().0, 3);
    assert_eq!(replays[0].len(), 4);
}

#[tokio::test]
async fn resume_past_retention_window_asks_for_snapshot() {
    let log = MemoryEventLog::with_config(LogConfig {
        retention_window: 3,
        ..LogConfig::default()
    });
    let registry = SessionRegistry::new(
        Arc::new(log),
        Arc::new(echo()),
        Arc::new(StaticPolicy::allow_all()),
        SessionConfig::default(),
    );
    let mut client = Client::connect(&registry, "window").await;
    client.command(&registry, json!({"type": "send", "text": "hi"})).await;
    client.until("turn_done").await;

    let (conn, mut rx) = registry.connect();
    registry
        .handle_text(
            &conn,
            r#"{"type":"resume","session_id":"window","last_seen_event_id":1,"req_id":"r"}"#,
        )
        .await;

    let welcome = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
    assert_eq!(welcome["type"], "welcome");
    let error = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
    assert_eq!(describe(&error), "error:REPLAY_WINDOW_EXCEEDED");
    assert_eq!(error["req_id"], "r");
    assert_eq!(error["details"]["action"], "get_snapshot");

    registry
        .handle_text(&conn, r#"{"type":"get_snapshot","session_id":"window"}"#)
        .await;
    let snapshot = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["as_of_event_id"], 6);
    assert_eq!(snapshot["run_state"]["status"], "finished");
    assert_eq!(snapshot["transcript"].as_array().unwrap().len(), 2);

    // attached for live events despite the gap
    assert_eq!(registry.fanout().count(&SessionId::new("window")), 2);
}

#[tokio::test]
async fn worker_failure_ends_run_in_error() {
    let worker = worker_fn(|_ctx: RunContext, sink: WorkerSink| async move {
        sink.started().await;
        Err("model unavailable".to_string())
    });
    let registry = registry_with(worker, StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "err").await;

    client.command(&registry, json!({"type": "send", "text": "hi"})).await;
    let frames = client.until("run_status:error").await;

    assert_eq!(
        logged(&frames),
        vec![
            "run_status:starting",
            "user_text",
            "run_status:running",
            "error:AGENT_ERROR",
            "run_status:error",
        ]
    );
    assert_eq!(
        frames.last().unwrap()["run_state"]["error"],
        "model unavailable"
    );
}

#[tokio::test]
async fn worker_panic_ends_run_in_error() {
    let worker = worker_fn(|ctx: RunContext, sink: WorkerSink| async move {
        sink.started().await;
        if ctx.input == "boom" {
            panic!("worker bug");
        }
        Ok(())
    });
    let registry = registry_with(worker, StaticPolicy::allow_all(), SessionConfig::default());
    let mut client = Client::connect(&registry, "panic").await;

    client.command(&registry, json!({"type": "send", "text": "boom"})).await;
    let frames = client.until("run_status:error").await;
    assert_eq!(
        frames.last().unwrap()["run_state"]["error"],
        "worker panicked"
    );

    // the session stays usable
    client.command(&registry, json!({"type": "send", "text": "fine"})).await;
    client.until("turn_done").await;
}

#[tokio::test]
async fn sessions_do_not_share_state() {
    let registry = registry_with(stubborn(), StaticPolicy::allow_all(), SessionConfig::default());
    let mut first = Client::connect(&registry, "one").await;
    let mut second = Client::connect(&registry, "two").await;

    first.command(&registry, json!({"type": "send", "text": "x"})).await;
    first.until("run_status:running").await;
    second.command(&registry, json!({"type": "send", "text": "y"})).await;
    let frames = second.until("run_status:running").await;

    assert_eq!(event_ids(&frames), vec![1, 2, 3]);
}

#[tokio::test]
async fn finishing_with_a_pending_approval_passes_through_running() {
    let finish = Arc::new(Notify::new());
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let outcome_tx = Arc::new(std::sync::Mutex::new(Some(outcome_tx)));
    let worker = {
        let finish = Arc::clone(&finish);
        worker_fn(move |ctx: RunContext, sink: WorkerSink| {
            let finish = Arc::clone(&finish);
            let outcome_tx = Arc::clone(&outcome_tx);
            async move {
                sink.started().await;
                let tools = ctx.tools.clone();
                tokio::spawn(async move {
                    let call = ToolCall::new("c1", "shell", json!({"cmd": "rm -rf tmp"}));
                    let outcome = tools.invoke(call, |_| async { Ok(json!({})) }).await;
                    if let Some(tx) = outcome_tx.lock().unwrap().take() {
                        let _ = tx.send(outcome);
                    }
                });
                finish.notified().await;
                Ok(())
            }
        })
    };
    let registry = registry_with(worker, ask_everything(), SessionConfig::default());
    let mut client = Client::connect(&registry, "detached").await;

    client.command(&registry, json!({"type": "send", "text": "clean up"})).await;
    client.until("run_status:awaiting_approval").await;
    finish.notify_one();
    let frames = client.until("run_status:finished").await;

    let statuses: Vec<String> = logged(&frames)
        .into_iter()
        .filter(|label| label.starts_with("run_status:"))
        .collect();
    assert_eq!(statuses, vec!["run_status:running", "run_status:finished"]);
    let finished = frames.last().unwrap();
    assert_eq!(finished["run_state"]["pending_approvals"], json!([]));

    let outcome = timeout(WAIT, outcome_rx)
        .await
        .expect("Tool call never resolved")
        .expect("Tool task dropped");
    assert!(matches!(outcome, ToolOutcome::Cancelled));

    let log = full_log(&registry, "detached").await;
    let statuses: Vec<RunStatus> = log
        .iter()
        .filter_map(|(_, payload)| match payload {
            EventPayload::RunStatus { run_state } => Some(run_state.status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            RunStatus::Starting,
            RunStatus::Running,
            RunStatus::AwaitingApproval,
            RunStatus::Running,
            RunStatus::Finished,
        ]
    );
}

#[tokio::test]
async fn failed_append_reports_run_error_to_every_client() {
    // starting, user_text and running land; the assistant text does not
    let registry = SessionRegistry::new(
        Arc::new(FlakyLog::new(4)),
        Arc::new(echo()),
        Arc::new(StaticPolicy::allow_all()),
        SessionConfig::default(),
    );
    let mut sender = Client::connect(&registry, "flaky").await;
    let mut watcher = Client::connect(&registry, "flaky").await;

    sender.command(&registry, json!({"type": "send", "text": "hi"})).await;
    let frames = watcher.until("run_status:error").await;

    assert_eq!(
        logged(&frames),
        vec!["run_status:starting", "user_text", "run_status:running"]
    );
    let forced = frames.last().unwrap();
    assert!(forced.get("event_id").is_none());
    assert_eq!(forced["run_id"], 1);
    assert_eq!(forced["run_state"]["run_id"], 1);
    assert!(forced["run_state"]["error"]
        .as_str()
        .unwrap()
        .contains("disk full"));

    let error = watcher.next().await;
    assert_eq!(describe(&error), "error:INTERNAL");
    assert!(error.get("event_id").is_none());

    let frames = sender.until("error:INTERNAL").await;
    assert!(frames
        .iter()
        .any(|frame| describe(frame) == "run_status:error" && frame.get("event_id").is_none()));

    // the session refuses further work
    let session = registry.lookup(&SessionId::new("flaky")).expect("Session not loaded");
    assert!(!session.status().await.is_active());
    sender.command(&registry, json!({"type": "send", "text": "again"})).await;
    assert_eq!(describe(&sender.next().await), "error:INTERNAL");
}
