//! Run lifecycle state machine

use std::collections::VecDeque;

use session_core::{ApprovalBrief, CallId, RunId, RunState, RunStatus};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};

/// Outcome of a `send` command
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RunState),
    /// The `client_msg_id` was already seen for this run
    Duplicate(RunId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortOutcome {
    Started(RunState),
    AlreadyAborting(RunId),
}

struct ActiveRun {
    state: RunState,
    cancel: CancellationToken,
    saw_function_output: bool,
}

/// Owns at most one active run per session plus a bounded history of
/// finished ones. Every mutating method returns the full new [`RunState`]
/// so the caller can emit it as a `run_status` event.
pub struct RunCoordinator {
    run_counter: u64,
    active: Option<ActiveRun>,
    history: VecDeque<RunState>,
    history_limit: usize,
    /// Correlation token of the latest send and the run it produced
    last_client_msg: Option<(String, RunId)>,
}

impl RunCoordinator {
    pub fn new(history_limit: usize) -> Self {
        Self {
            run_counter: 0,
            active: None,
            history: VecDeque::new(),
            history_limit,
            last_client_msg: None,
        }
    }

    pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(&to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition { from, to })
        }
    }

    fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
        match from {
            RunStatus::Idle => &[RunStatus::Starting],
            RunStatus::Starting => &[RunStatus::Running, RunStatus::Aborting, RunStatus::Error],
            RunStatus::Running => &[
                RunStatus::AwaitingApproval,
                RunStatus::Aborting,
                RunStatus::Finished,
                RunStatus::Error,
            ],
            RunStatus::AwaitingApproval => &[
                RunStatus::Running,
                RunStatus::Aborting,
                RunStatus::Error,
            ],
            RunStatus::Aborting => &[RunStatus::Aborted],
            RunStatus::Finished | RunStatus::Error | RunStatus::Aborted => &[],
        }
    }

    pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    pub fn run_counter(&self) -> u64 {
        self.run_counter
    }

    pub fn active(&self) -> Option<&RunState> {
        self.active.as_ref().map(|run| &run.state)
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.active().map(|state| state.run_id)
    }

    /// Status of the active run, `Idle` when there is none
    pub fn status(&self) -> RunStatus {
        self.active().map(|state| state.status).unwrap_or_default()
    }

    pub fn is_current(&self, run_id: RunId) -> bool {
        self.active_run_id() == Some(run_id)
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|run| run.cancel.clone())
    }

    /// Active run first, then history newest first
    pub fn runs(&self) -> Vec<RunState> {
        self.active()
            .cloned()
            .into_iter()
            .chain(self.history.iter().rev().cloned())
            .collect()
    }

    pub fn start(&mut self, client_msg_id: Option<&str>) -> Result<StartOutcome> {
        if let (Some(token), Some((seen, run_id))) = (client_msg_id, &self.last_client_msg) {
            if token == seen {
                return Ok(StartOutcome::Duplicate(*run_id));
            }
        }

        if let Some(active) = self.active_run_id() {
            return Err(OrchestratorError::Busy { active });
        }
        Self::validate_transition(RunStatus::Idle, RunStatus::Starting)?;

        self.run_counter += 1;
        let run_id = RunId(self.run_counter);
        let state = RunState::new(run_id);
        self.active = Some(ActiveRun {
            state: state.clone(),
            cancel: CancellationToken::new(),
            saw_function_output: false,
        });
        self.last_client_msg = client_msg_id.map(|token| (token.to_string(), run_id));

        Ok(StartOutcome::Started(state))
    }

    fn transition(&mut self, to: RunStatus) -> Result<&mut ActiveRun> {
        let run = self.active.as_mut().ok_or(OrchestratorError::NotRunning)?;
        Self::validate_transition(run.state.status, to)?;
        run.state.status = to;
        Ok(run)
    }

    /// `starting → running`; a no-op once running
    pub fn mark_running(&mut self) -> Result<Option<RunState>> {
        if self.status() != RunStatus::Starting {
            return Ok(None);
        }
        let run = self.transition(RunStatus::Running)?;
        Ok(Some(run.state.clone()))
    }

    /// Record a pending approval, moving to `awaiting_approval` if needed.
    pub fn await_approval(&mut self, brief: ApprovalBrief) -> Result<RunState> {
        let run = match self.status() {
            RunStatus::AwaitingApproval => self
                .active
                .as_mut()
                .ok_or(OrchestratorError::NotRunning)?,
            _ => self.transition(RunStatus::AwaitingApproval)?,
        };
        run.state.pending_approvals.push(brief);
        Ok(run.state.clone())
    }

    /// Drop a resolved approval; back to `running` once none are pending.
    pub fn resolve_approval(&mut self, call_id: &CallId) -> Result<RunState> {
        let run = self.active.as_mut().ok_or(OrchestratorError::NotRunning)?;
        run.state
            .pending_approvals
            .retain(|brief| &brief.call_id != call_id);

        if run.state.status == RunStatus::AwaitingApproval && run.state.pending_approvals.is_empty()
        {
            return Ok(self.transition(RunStatus::Running)?.state.clone());
        }
        Ok(run.state.clone())
    }

    /// `abort(run_id?)`: signal cancellation and enter `aborting`.
    pub fn begin_abort(&mut self, requested: Option<RunId>) -> Result<AbortOutcome> {
        let active = self.active_run_id().ok_or(OrchestratorError::NotRunning)?;
        if let Some(requested) = requested {
            if requested != active {
                return Err(OrchestratorError::StaleRunId {
                    requested,
                    active: Some(active),
                });
            }
        }
        if self.status() == RunStatus::Aborting {
            return Ok(AbortOutcome::AlreadyAborting(active));
        }

        let run = self.transition(RunStatus::Aborting)?;
        run.state.pending_approvals.clear();
        run.cancel.cancel();
        Ok(AbortOutcome::Started(run.state.clone()))
    }

    pub fn note_function_output(&mut self) {
        if let Some(run) = self.active.as_mut() {
            run.saw_function_output = true;
        }
    }

    pub fn saw_function_output(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|run| run.saw_function_output)
    }

    /// Move the active run to a terminal status and demote it to history.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) -> Result<RunState> {
        debug_assert!(status.is_terminal());
        let run = self.transition(status)?;
        run.state.finish(status, error);
        run.cancel.cancel();
        let state = run.state.clone();
        self.demote();
        Ok(state)
    }

    /// Finalize without transition checks. Used when the session can no
    /// longer record events and the run must not stay active.
    pub fn force_error(&mut self, error: impl Into<String>) -> Option<RunState> {
        let run = self.active.as_mut()?;
        run.state.finish(RunStatus::Error, Some(error.into()));
        run.cancel.cancel();
        let state = run.state.clone();
        self.demote();
        Some(state)
    }

    fn demote(&mut self) {
        if let Some(run) = self.active.take() {
            self.history.push_back(run.state);
            while self.history.len() > self.history_limit {
                self.history.pop_front();
            }
        }
    }

    /// Rebuild from a persisted snapshot. A run that was still active is
    /// reinstated so the caller can finalize it.
    pub fn restore(&mut self, run_counter: u64, latest: Option<RunState>) {
        self.run_counter = run_counter;
        let Some(state) = latest else { return };
        self.run_counter = self.run_counter.max(state.run_id.get());

        if state.is_active() {
            self.active = Some(ActiveRun {
                state,
                cancel: CancellationToken::new(),
                saw_function_output: false,
            });
        } else {
            self.history.push_back(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn brief(call_id: &str) -> ApprovalBrief {
        ApprovalBrief {
            call_id: CallId::new(call_id),
            tool_key: "shell".to_string(),
            args: json!({}),
        }
    }

    fn started(coordinator: &mut RunCoordinator) -> RunState {
        match coordinator.start(None).unwrap() {
            StartOutcome::Started(state) => state,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(RunCoordinator::can_transition(RunStatus::Idle, RunStatus::Starting));
        assert!(RunCoordinator::can_transition(RunStatus::Running, RunStatus::AwaitingApproval));
        assert!(RunCoordinator::can_transition(RunStatus::AwaitingApproval, RunStatus::Running));
        assert!(RunCoordinator::can_transition(RunStatus::Aborting, RunStatus::Aborted));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunStatus::Finished, RunStatus::Error, RunStatus::Aborted] {
            assert!(!RunCoordinator::can_transition(terminal, RunStatus::Idle));
            assert!(!RunCoordinator::can_transition(terminal, RunStatus::Running));
        }
        assert!(!RunCoordinator::can_transition(RunStatus::Aborting, RunStatus::Finished));
        assert!(!RunCoordinator::can_transition(RunStatus::Idle, RunStatus::Running));
    }

    #[test]
    fn test_start_assigns_increasing_run_ids() {
        let mut coordinator = RunCoordinator::new(4);
        let first = started(&mut coordinator);
        assert_eq!(first.run_id, RunId(1));
        assert_eq!(first.status, RunStatus::Starting);

        coordinator.mark_running().unwrap();
        coordinator.finish(RunStatus::Finished, None).unwrap();

        let second = started(&mut coordinator);
        assert_eq!(second.run_id, RunId(2));
        assert_eq!(coordinator.run_counter(), 2);
    }

    #[test]
    fn test_busy_while_active() {
        let mut coordinator = RunCoordinator::new(4);
        started(&mut coordinator);

        let err = coordinator.start(Some("m2")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Busy { active: RunId(1) }));
        assert_eq!(coordinator.run_counter(), 1);
        assert_eq!(coordinator.status(), RunStatus::Starting);
    }

    #[test]
    fn test_duplicate_client_msg_id() {
        let mut coordinator = RunCoordinator::new(4);
        assert!(matches!(
            coordinator.start(Some("m1")).unwrap(),
            StartOutcome::Started(_)
        ));
        assert_eq!(
            coordinator.start(Some("m1")).unwrap(),
            StartOutcome::Duplicate(RunId(1))
        );

        // still recognised after the run has finished
        coordinator.mark_running().unwrap();
        coordinator.finish(RunStatus::Finished, None).unwrap();
        assert_eq!(
            coordinator.start(Some("m1")).unwrap(),
            StartOutcome::Duplicate(RunId(1))
        );
        assert_eq!(coordinator.run_counter(), 1);
    }

    #[test]
    fn test_approval_round_trip() {
        let mut coordinator = RunCoordinator::new(4);
        started(&mut coordinator);
        coordinator.mark_running().unwrap();

        let state = coordinator.await_approval(brief("c1")).unwrap();
        assert_eq!(state.status, RunStatus::AwaitingApproval);
        let state = coordinator.await_approval(brief("c2")).unwrap();
        assert_eq!(state.pending_approvals.len(), 2);

        let state = coordinator.resolve_approval(&CallId::new("c1")).unwrap();
        assert_eq!(state.status, RunStatus::AwaitingApproval);
        let state = coordinator.resolve_approval(&CallId::new("c2")).unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.pending_approvals.is_empty());
    }

    #[test]
    fn test_abort_paths() {
        let mut coordinator = RunCoordinator::new(4);
        assert!(matches!(
            coordinator.begin_abort(None),
            Err(OrchestratorError::NotRunning)
        ));

        started(&mut coordinator);
        let token = coordinator.cancel_token().unwrap();
        assert!(matches!(
            coordinator.begin_abort(Some(RunId(9))),
            Err(OrchestratorError::StaleRunId { .. })
        ));

        let AbortOutcome::Started(state) = coordinator.begin_abort(Some(RunId(1))).unwrap() else {
            panic!("expected abort to start");
        };
        assert_eq!(state.status, RunStatus::Aborting);
        assert!(token.is_cancelled());
        assert_eq!(
            coordinator.begin_abort(None).unwrap(),
            AbortOutcome::AlreadyAborting(RunId(1))
        );

        let state = coordinator.finish(RunStatus::Aborted, None).unwrap();
        assert_eq!(state.status, RunStatus::Aborted);
        assert!(coordinator.active().is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut coordinator = RunCoordinator::new(2);
        for _ in 0..3 {
            started(&mut coordinator);
            coordinator.finish(RunStatus::Error, Some("boom".into())).unwrap();
        }

        let runs = coordinator.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, RunId(3));
        assert_eq!(runs[1].run_id, RunId(2));
    }

    #[test]
    fn test_restore_reinstates_interrupted_run() {
        let mut coordinator = RunCoordinator::new(4);
        let mut state = RunState::new(RunId(5));
        state.status = RunStatus::AwaitingApproval;
        coordinator.restore(5, Some(state));

        assert_eq!(coordinator.active_run_id(), Some(RunId(5)));
        let finished = coordinator
            .finish(RunStatus::Error, Some("interrupted".into()))
            .unwrap();
        assert_eq!(finished.status, RunStatus::Error);
        assert!(finished.finished_at.is_some());

        let next = started(&mut coordinator);
        assert_eq!(next.run_id, RunId(6));
    }

    #[test]
    fn test_force_error_skips_transition_checks() {
        let mut coordinator = RunCoordinator::new(4);
        started(&mut coordinator);
        coordinator.begin_abort(None).unwrap();

        let state = coordinator.force_error("storage failed").unwrap();
        assert_eq!(state.status, RunStatus::Error);
        assert!(coordinator.active().is_none());
    }
}
