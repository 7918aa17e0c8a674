use events::EventEnvelope;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub session_id: String,
    pub event_id: i64,
    pub run_id: Option<i64>,
    pub event_type: String,
    pub envelope: String,
    pub created_at: i64,
}

impl EventRow {
    pub fn into_domain(self) -> Result<EventEnvelope, DbError> {
        Ok(serde_json::from_str(&self.envelope)?)
    }
}

impl TryFrom<&EventEnvelope> for EventRow {
    type Error = DbError;

    fn try_from(envelope: &EventEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: envelope.session_id.to_string(),
            event_id: envelope.event_id as i64,
            run_id: envelope.run_id.map(|r| r.get() as i64),
            event_type: envelope.payload.kind().to_string(),
            envelope: serde_json::to_string(envelope)?,
            created_at: envelope.timestamp.timestamp(),
        })
    }
}
