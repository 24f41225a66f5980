use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use super::workspace::Workspace;

/// A durable executor thread within a workspace. `executor` stays null until
/// the first coding-agent run starts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub executor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub async fn parent_workspace(
        &self,
        pool: &SqlitePool,
    ) -> Result<Option<Workspace>, sqlx::Error> {
        Workspace::find_by_id(pool, self.workspace_id).await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE workspace_id = $1 ORDER BY created_at ASC",
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_latest_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE workspace_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        workspace_id: Uuid,
        session_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "INSERT INTO sessions (id, workspace_id) VALUES ($1, $2) RETURNING *",
        )
        .bind(session_id)
        .bind(workspace_id)
        .fetch_one(pool)
        .await
    }

    /// Find the session for a workspace, creating one if none exists yet.
    pub async fn find_or_create(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        if let Some(session) = Self::find_latest_by_workspace_id(pool, workspace_id).await? {
            return Ok(session);
        }
        Self::create(pool, workspace_id, Uuid::new_v4()).await
    }

    pub async fn update_executor(
        pool: &SqlitePool,
        id: Uuid,
        executor: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sessions SET executor = $2, updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .bind(executor)
        .execute(pool)
        .await?;
        Ok(())
    }
}
