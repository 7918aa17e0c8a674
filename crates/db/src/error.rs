use events::LogError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt row: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl From<DbError> for LogError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::SessionNotFound(id) => LogError::SessionNotFound(id.as_str().into()),
            DbError::Corrupt(e) => LogError::Serialization(e),
            other => LogError::Storage(other.to_string()),
        }
    }
}
