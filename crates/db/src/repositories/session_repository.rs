use crate::error::DbError;
use crate::models::SessionRow;
use events::SessionSnapshot;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the session unless it already exists. Returns whether it was created.
    pub async fn create_if_missing(
        &self,
        session_id: &str,
        version: &str,
        capabilities: &[String],
        snapshot: &SessionSnapshot,
    ) -> Result<bool, DbError> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO sessions (session_id, version, capabilities, snapshot, next_event_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(version)
        .bind(serde_json::to_string(capabilities)?)
        .bind(serde_json::to_string(snapshot)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRow>, DbError> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT session_id, version, capabilities, snapshot, next_event_id, created_at, updated_at
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_ids(&self) -> Result<Vec<String>, DbError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT session_id FROM sessions ORDER BY session_id ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete a session and its events. Returns whether it existed.
    pub async fn delete(&self, session_id: &str) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM events WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
