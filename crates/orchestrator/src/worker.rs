//! The agent worker seam and the tool gate it calls through.
//!
//! A [`Worker`] turns one user input into a stream of [`WorkerEvent`]s. The
//! session consumes the stream one event at a time; tool calls go through
//! the [`ToolGate`] in the worker's [`RunContext`], which applies the
//! approval policy and records the call and its output in the log.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::FutureExt;
use serde_json::{json, Value};
use session_core::{CallId, RunId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::approval::Resolution;
use crate::error::OrchestratorError;
use crate::session::{denial, Admission, Session};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    AssistantText(String),
    Reasoning(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker began producing output
    Started,
    Output(WorkerOutput),
    Finished,
    Failed(String),
}

/// Everything a worker gets for one run
pub struct RunContext {
    pub run_id: RunId,
    pub input: String,
    /// Cancelled when the run is aborted
    pub cancel: CancellationToken,
    pub tools: ToolGate,
}

/// Agent turn executor
pub trait Worker: Send + Sync + 'static {
    fn start(&self, ctx: RunContext) -> BoxStream<'static, WorkerEvent>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: CallId,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: CallId::new(call_id),
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug)]
pub enum ToolOutcome {
    Completed { output: Value, is_error: bool },
    Denied { abort: bool },
    /// The run was aborted before or during execution
    Cancelled,
    /// The call could not be admitted (duplicate id, run no longer current)
    Rejected(OrchestratorError),
}

/// Handle a worker uses to execute tool calls under the session's approval
/// policy.
#[derive(Clone)]
pub struct ToolGate {
    session: Weak<Session>,
    run_id: RunId,
    cancel: CancellationToken,
}

impl ToolGate {
    pub(crate) fn new(session: Weak<Session>, run_id: RunId, cancel: CancellationToken) -> Self {
        Self {
            session,
            run_id,
            cancel,
        }
    }

    /// Run `exec` once the call is authorized.
    ///
    /// The call is in flight from the moment it is authorized until its
    /// `function_call_output` has been recorded, whichever path authorized it.
    pub async fn invoke<F, Fut>(&self, call: ToolCall, exec: F) -> ToolOutcome
    where
        F: FnOnce(Value) -> Fut + Send,
        Fut: Future<Output = Result<Value, String>> + Send,
    {
        let Some(session) = self.session.upgrade() else {
            return ToolOutcome::Cancelled;
        };

        let guard = match session.admit_tool(self.run_id, &call).await {
            Ok(Admission::Execute(guard)) => guard,
            Ok(Admission::Wait(receiver)) => {
                let resolution = tokio::select! {
                    resolution = receiver => resolution.unwrap_or(Resolution::Cancelled),
                    _ = self.cancel.cancelled() => Resolution::Cancelled,
                };
                match resolution {
                    Resolution::Approved(guard) => guard,
                    Resolution::Denied { abort } => {
                        if !abort {
                            let _ = session
                                .record_tool_output(
                                    self.run_id,
                                    &call.call_id,
                                    denial("approval"),
                                    true,
                                    false,
                                )
                                .await;
                        }
                        return ToolOutcome::Denied { abort };
                    }
                    Resolution::Cancelled => return ToolOutcome::Cancelled,
                }
            }
            Ok(Admission::Denied { abort }) => return ToolOutcome::Denied { abort },
            Ok(Admission::Cancelled) => return ToolOutcome::Cancelled,
            Err(e) => return ToolOutcome::Rejected(e),
        };

        let result = tokio::select! {
            result = exec(call.args.clone()) => result,
            _ = self.cancel.cancelled() => return ToolOutcome::Cancelled,
        };
        let (output, is_error) = match result {
            Ok(output) => (output, false),
            Err(message) => (json!({ "error": message }), true),
        };

        let recorded = session
            .record_tool_output(self.run_id, &call.call_id, output.clone(), is_error, true)
            .await;
        drop(guard);

        match recorded {
            Ok(true) => ToolOutcome::Completed { output, is_error },
            Ok(false) => ToolOutcome::Cancelled,
            Err(e) => ToolOutcome::Rejected(e),
        }
    }
}

/// Emits worker events from inside a [`worker_fn`] body.
///
/// Each emit waits until the session has consumed the event, so outputs and
/// tool calls land in the log in the order the worker produced them.
#[derive(Clone)]
pub struct WorkerSink {
    tx: mpsc::UnboundedSender<(WorkerEvent, oneshot::Sender<()>)>,
}

impl WorkerSink {
    pub async fn emit(&self, event: WorkerEvent) {
        let (ack, consumed) = oneshot::channel();
        if self.tx.send((event, ack)).is_ok() {
            let _ = consumed.await;
        }
    }

    pub async fn started(&self) {
        self.emit(WorkerEvent::Started).await
    }

    pub async fn assistant_text(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::Output(WorkerOutput::AssistantText(text.into())))
            .await
    }

    pub async fn reasoning(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::Output(WorkerOutput::Reasoning(text.into())))
            .await
    }
}

/// Stream adapter that drives a worker body and yields what it emits,
/// followed by `Finished` or `Failed` from the body's result.
struct SinkStream {
    body: Option<BoxFuture<'static, Result<(), String>>>,
    rx: mpsc::UnboundedReceiver<(WorkerEvent, oneshot::Sender<()>)>,
    ack: Option<oneshot::Sender<()>>,
    terminal: Option<WorkerEvent>,
}

impl SinkStream {
    fn new<Fut>(make: impl FnOnce(WorkerSink) -> Fut) -> Self
    where
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            body: Some(make(WorkerSink { tx }).boxed()),
            rx,
            ack: None,
            terminal: None,
        }
    }
}

impl Stream for SinkStream {
    type Item = WorkerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // Being polled again means the previous event was consumed
        if let Some(ack) = this.ack.take() {
            let _ = ack.send(());
        }

        if let Poll::Ready(Some((event, ack))) = this.rx.poll_recv(cx) {
            this.ack = Some(ack);
            return Poll::Ready(Some(event));
        }

        if let Some(body) = this.body.as_mut() {
            match body.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    this.body = None;
                    this.terminal = Some(match result {
                        Ok(()) => WorkerEvent::Finished,
                        Err(message) => WorkerEvent::Failed(message),
                    });
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if let Poll::Ready(Some((event, ack))) = this.rx.poll_recv(cx) {
            this.ack = Some(ack);
            return Poll::Ready(Some(event));
        }
        Poll::Ready(this.terminal.take())
    }
}

/// [`Worker`] built from an async function of the run context and a sink.
///
/// `Ok(())` finishes the run, `Err(message)` fails it.
pub struct FnWorker<F> {
    body: F,
}

pub fn worker_fn<F, Fut>(body: F) -> FnWorker<F>
where
    F: Fn(RunContext, WorkerSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    FnWorker { body }
}

impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(RunContext, WorkerSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn start(&self, ctx: RunContext) -> BoxStream<'static, WorkerEvent> {
        Box::pin(SinkStream::new(|sink| (self.body)(ctx, sink)))
    }
}

/// Default worker: echoes the input back.
///
/// An input of the form `/tool <name> [json args]` performs a tool call
/// through the gate whose result echoes its arguments, which makes the
/// approval flow usable without a real agent behind the server.
#[derive(Debug, Clone, Default)]
pub struct EchoWorker;

impl Worker for EchoWorker {
    fn start(&self, ctx: RunContext) -> BoxStream<'static, WorkerEvent> {
        Box::pin(SinkStream::new(|sink| echo(ctx, sink)))
    }
}

async fn echo(ctx: RunContext, sink: WorkerSink) -> Result<(), String> {
    sink.started().await;

    let Some(rest) = ctx.input.strip_prefix("/tool ") else {
        sink.assistant_text(ctx.input.clone()).await;
        return Ok(());
    };

    let (name, raw_args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
    let args = if raw_args.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(raw_args).unwrap_or_else(|_| json!({ "input": raw_args }))
    };
    let call = ToolCall::new(format!("call-{}", ctx.run_id), name, args);

    let outcome = ctx
        .tools
        .invoke(call, |args| async move { Ok(json!({ "echo": args })) })
        .await;
    match outcome {
        ToolOutcome::Completed { output, .. } => {
            sink.assistant_text(format!("{} returned {}", name, output))
                .await;
            Ok(())
        }
        ToolOutcome::Denied { .. } => {
            sink.assistant_text(format!("{} was denied", name)).await;
            Ok(())
        }
        ToolOutcome::Cancelled => Ok(()),
        ToolOutcome::Rejected(e) => Err(e.to_string()),
    }
}
