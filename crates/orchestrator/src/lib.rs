//! Session and run coordination.
//!
//! - [`RunCoordinator`]: the per-session run lifecycle state machine
//! - [`ApprovalGateway`]: pending approvals and the in-flight registry
//! - [`ConnectionFanout`]: attached connections, replay and backpressure
//! - [`Session`]: the actor serializing all of the above for one session
//! - [`SessionRegistry`]: creates, routes to and evicts sessions

pub mod approval;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod policy;
pub mod registry;
pub mod session;
pub mod worker;

pub use approval::{ApprovalGateway, InflightGuard, InflightTracker, Resolution};
pub use config::{BackpressureConfig, PolicyConfig, SessionConfig};
pub use coordinator::{AbortOutcome, RunCoordinator, StartOutcome};
pub use error::{OrchestratorError, Result};
pub use fanout::{
    Connection, ConnectionFanout, ConnectionReceiver, Outbound, ReplayOutcome, Reply, ReplyFrame,
    SignalFrame,
};
pub use policy::{ApprovalPolicy, StaticPolicy};
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{Services, Session};
pub use worker::{
    worker_fn, EchoWorker, FnWorker, RunContext, ToolCall, ToolGate, ToolOutcome, Worker,
    WorkerEvent, WorkerOutput, WorkerSink,
};
