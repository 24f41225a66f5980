use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Follow-up prompt submitted while a coding agent was still running.
/// Consumed oldest-first when the engine decides the next action.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub async fn enqueue(
        pool: &SqlitePool,
        session_id: Uuid,
        prompt: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, QueuedMessage>(
            "INSERT INTO queued_messages (id, session_id, prompt) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(prompt)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_session_id(
        pool: &SqlitePool,
        session_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, QueuedMessage>(
            "SELECT * FROM queued_messages WHERE session_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(pool)
        .await
    }

    /// Atomically remove and return the oldest queued message for a session.
    pub async fn pop_oldest(
        pool: &SqlitePool,
        session_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, QueuedMessage>(
            r#"DELETE FROM queued_messages
               WHERE id = (
                   SELECT id FROM queued_messages
                   WHERE session_id = $1
                   ORDER BY created_at ASC
                   LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM queued_messages WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
