mod approval;
mod ids;
mod run;
mod session;
mod transcript;

pub use approval::{ApprovalDecision, PolicyDecision};
pub use ids::{CallId, ConnectionId, RunId, SessionId};
pub use run::{ApprovalBrief, RunState, RunStatus};
pub use session::SessionState;
pub use transcript::TranscriptItem;
