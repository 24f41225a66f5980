use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// One agent turn inside a coding-agent execution. `agent_session_id` and
/// `agent_message_id` are the executor's own identifiers, discovered while
/// its output streams; they make resume-at-message follow-ups possible.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CodingAgentTurn {
    pub id: Uuid,
    pub execution_process_id: Uuid,
    pub prompt: Option<String>,
    pub summary: Option<String>,
    pub agent_session_id: Option<String>,
    pub agent_message_id: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodingAgentTurn {
    pub async fn create(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        prompt: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, CodingAgentTurn>(
            r#"INSERT INTO coding_agent_turns (id, execution_process_id, prompt)
               VALUES ($1, $2, $3)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_process_id)
        .bind(prompt)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_execution_process_id(
        pool: &SqlitePool,
        execution_process_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, CodingAgentTurn>(
            "SELECT * FROM coding_agent_turns WHERE execution_process_id = $1",
        )
        .bind(execution_process_id)
        .fetch_optional(pool)
        .await
    }

    /// The most recent turn of a session's non-dropped history; its ids are
    /// what a follow-up resumes from.
    pub async fn find_latest_by_session_id(
        pool: &SqlitePool,
        session_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, CodingAgentTurn>(
            r#"SELECT t.* FROM coding_agent_turns t
               JOIN execution_processes ep ON t.execution_process_id = ep.id
               WHERE ep.session_id = $1 AND ep.dropped = FALSE
               ORDER BY ep.created_at DESC
               LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_agent_session_id(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        agent_session_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE coding_agent_turns
               SET agent_session_id = $2, updated_at = datetime('now', 'subsec')
               WHERE execution_process_id = $1"#,
        )
        .bind(execution_process_id)
        .bind(agent_session_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_agent_message_id(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        agent_message_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE coding_agent_turns
               SET agent_message_id = $2, updated_at = datetime('now', 'subsec')
               WHERE execution_process_id = $1"#,
        )
        .bind(execution_process_id)
        .bind(agent_message_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_summary(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        summary: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE coding_agent_turns
               SET summary = $2, updated_at = datetime('now', 'subsec')
               WHERE execution_process_id = $1"#,
        )
        .bind(execution_process_id)
        .bind(summary)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_seen(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE coding_agent_turns SET seen = TRUE, updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
