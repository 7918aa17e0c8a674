use crate::error::DbError;
use crate::models::EventRow;
use sqlx::{SqliteConnection, SqlitePool};

#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one event on a caller-owned connection (usually a transaction).
    pub async fn insert(conn: &mut SqliteConnection, row: &EventRow) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO events (session_id, event_id, run_id, event_type, envelope, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.session_id)
        .bind(row.event_id)
        .bind(row.run_id)
        .bind(&row.event_type)
        .bind(&row.envelope)
        .bind(row.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Drop events with id below `keep_from`. Returns the number deleted.
    pub async fn delete_before(
        conn: &mut SqliteConnection,
        session_id: &str,
        keep_from: i64,
    ) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM events WHERE session_id = ? AND event_id < ?")
            .bind(session_id)
            .bind(keep_from)
            .execute(conn)
            .await?;

        Ok(result.rows_affected())
    }

    /// Up to `limit` events with id greater than `after_event_id`, oldest first.
    pub async fn find_page(
        &self,
        session_id: &str,
        after_event_id: i64,
        limit: i64,
    ) -> Result<Vec<EventRow>, DbError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT session_id, event_id, run_id, event_type, envelope, created_at
            FROM events
            WHERE session_id = ? AND event_id > ?
            ORDER BY event_id ASC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(after_event_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn oldest_event_id(&self, session_id: &str) -> Result<Option<i64>, DbError> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MIN(event_id) FROM events WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.0)
    }

    pub async fn count_by_session_id(&self, session_id: &str) -> Result<i64, DbError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}
