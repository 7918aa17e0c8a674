use serde::{Deserialize, Serialize};
use session_core::{RunState, SessionId, SessionState, TranscriptItem};

use crate::log::SessionMeta;
use crate::types::EventEnvelope;

/// Point-in-time view of a session, consistent with `as_of_event_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub session_state: SessionState,
    pub run_state: Option<RunState>,
    /// Latest run's transcript, most recent items last
    pub transcript: Vec<TranscriptItem>,
    pub as_of_event_id: u64,
}

impl SessionSnapshot {
    pub fn empty(session_id: SessionId, meta: &SessionMeta) -> Self {
        Self {
            session_state: SessionState::new(
                session_id,
                meta.version.clone(),
                meta.capabilities.clone(),
            ),
            run_state: None,
            transcript: Vec::new(),
            as_of_event_id: 0,
        }
    }

    /// Fold one appended event into the view.
    pub fn apply(&mut self, envelope: &EventEnvelope, transcript_window: usize) {
        if let Some(run_state) = envelope.payload.run_state() {
            let is_new_run = self
                .run_state
                .as_ref()
                .map_or(true, |current| current.run_id != run_state.run_id);
            if is_new_run {
                self.transcript.clear();
            }

            let state = &mut self.session_state;
            state.run_counter = state.run_counter.max(run_state.run_id.get());
            state.active_run_id = run_state.is_active().then_some(run_state.run_id);
            self.run_state = Some(run_state.clone());
        } else if let Some(item) = envelope.payload.as_transcript() {
            self.transcript.push(item);
            if self.transcript.len() > transcript_window {
                let excess = self.transcript.len() - transcript_window;
                self.transcript.drain(..excess);
            }
        }

        self.session_state.last_event_id = Some(envelope.event_id);
        self.as_of_event_id = envelope.event_id;
    }
}
