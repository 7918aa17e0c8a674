//! Tool-call approval bookkeeping.
//!
//! The gateway owns two structures:
//!
//! - pending requests waiting for a human decision, each resolved exactly once
//! - the in-flight registry, which holds a call id for exactly as long as its
//!   tool is executing
//!
//! Both approval paths enter the in-flight registry through the same
//! [`ApprovalGateway::begin_execution`] helper, which hands back an
//! [`InflightGuard`]. Dropping the guard is the only way a call leaves the
//! registry, so completion, failure, cancellation and panics all release it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use session_core::{ApprovalBrief, ApprovalDecision, CallId};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// What the waiting tool call learns about its approval
#[derive(Debug)]
pub enum Resolution {
    /// Approved; execution has already been registered as in flight.
    Approved(InflightGuard),
    Denied { abort: bool },
    /// The run was aborted or the session torn down before a decision.
    Cancelled,
}

struct Pending {
    brief: ApprovalBrief,
    responder: oneshot::Sender<Resolution>,
}

/// Shared view of which calls are executing right now.
///
/// Cheap to clone and readable without the session lock.
#[derive(Debug, Clone, Default)]
pub struct InflightTracker {
    calls: Arc<Mutex<HashSet<CallId>>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_inflight_calls(&self) -> bool {
        self.count() > 0
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(call_id)
    }

    fn insert(&self, call_id: &CallId) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(call_id.clone())
    }

    fn remove(&self, call_id: &CallId) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(call_id);
    }
}

/// RAII half of the in-flight bracket.
///
/// Created only by [`ApprovalGateway::begin_execution`]; dropping it ends
/// the execution.
#[derive(Debug)]
#[must_use = "dropping the guard ends the execution immediately"]
pub struct InflightGuard {
    call_id: CallId,
    tracker: InflightTracker,
}

impl InflightGuard {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.call_id);
        debug!(call_id = %self.call_id, "Tool execution ended");
    }
}

/// Pending and in-flight tool calls of one session's active run
pub struct ApprovalGateway {
    pending: Vec<Pending>,
    /// Calls of the active run that already received their one decision
    resolved: HashSet<CallId>,
    inflight: InflightTracker,
}

impl ApprovalGateway {
    pub fn new(inflight: InflightTracker) -> Self {
        Self {
            pending: Vec::new(),
            resolved: HashSet::new(),
            inflight,
        }
    }

    fn is_pending(&self, call_id: &CallId) -> bool {
        self.pending.iter().any(|p| &p.brief.call_id == call_id)
    }

    fn ensure_unseen(&self, call_id: &CallId) -> Result<()> {
        if self.is_pending(call_id) || self.resolved.contains(call_id) || self.inflight.contains(call_id)
        {
            return Err(OrchestratorError::ApprovalConflict(call_id.clone()));
        }
        Ok(())
    }

    /// Register a call waiting for a human decision.
    pub fn request(&mut self, brief: ApprovalBrief) -> Result<oneshot::Receiver<Resolution>> {
        self.ensure_unseen(&brief.call_id)?;

        let (responder, receiver) = oneshot::channel();
        debug!(call_id = %brief.call_id, tool_key = %brief.tool_key, "Approval requested");
        self.pending.push(Pending { brief, responder });
        Ok(receiver)
    }

    /// Apply the one decision a pending call may receive.
    ///
    /// On approval the in-flight bracket opens here, before the decision is
    /// announced, so the call is visible as in flight from that moment on.
    pub fn decide(&mut self, call_id: &CallId, decision: ApprovalDecision) -> Result<()> {
        let Some(index) = self.pending.iter().position(|p| &p.brief.call_id == call_id) else {
            if self.resolved.contains(call_id) || self.inflight.contains(call_id) {
                return Err(OrchestratorError::ApprovalConflict(call_id.clone()));
            }
            return Err(OrchestratorError::UnknownCallId(call_id.clone()));
        };

        let pending = self.pending.remove(index);
        self.resolved.insert(call_id.clone());

        let resolution = match decision {
            ApprovalDecision::Approve => Resolution::Approved(self.begin_execution(call_id)?),
            ApprovalDecision::DenyContinue => Resolution::Denied { abort: false },
            ApprovalDecision::DenyAbort => Resolution::Denied { abort: true },
        };

        // A dropped receiver means the tool call was abandoned; an approval
        // guard inside the returned resolution is dropped with it.
        if pending.responder.send(resolution).is_err() {
            warn!(call_id = %call_id, "Approval decided after the waiting call went away");
        }
        Ok(())
    }

    /// ALLOW path: the policy approved the call, execution begins now.
    pub fn admit(&mut self, call_id: &CallId) -> Result<InflightGuard> {
        self.ensure_unseen(call_id)?;
        self.resolved.insert(call_id.clone());
        self.begin_execution(call_id)
    }

    /// The single entry into the in-flight registry, shared by both paths.
    fn begin_execution(&self, call_id: &CallId) -> Result<InflightGuard> {
        if !self.inflight.insert(call_id) {
            return Err(OrchestratorError::ApprovalConflict(call_id.clone()));
        }
        debug!(call_id = %call_id, "Tool execution started");
        Ok(InflightGuard {
            call_id: call_id.clone(),
            tracker: self.inflight.clone(),
        })
    }

    /// Resolve every pending request as cancelled. Returns their ids.
    pub fn cancel_all(&mut self) -> Vec<CallId> {
        let mut cancelled = Vec::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            let call_id = pending.brief.call_id.clone();
            let _ = pending.responder.send(Resolution::Cancelled);
            self.resolved.insert(call_id.clone());
            cancelled.push(call_id);
        }
        cancelled
    }

    /// Forget the previous run's calls. Executions still in flight keep
    /// their guards.
    pub fn reset(&mut self) {
        self.cancel_all();
        self.resolved.clear();
    }

    pub fn pending(&self) -> Vec<ApprovalBrief> {
        self.pending.iter().map(|p| p.brief.clone()).collect()
    }

    pub fn has_inflight_calls(&self) -> bool {
        self.inflight.has_inflight_calls()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.count()
    }
}
