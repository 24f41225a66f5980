use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::task::Task;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workspace not found")]
    WorkspaceNotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// A task attempt: one branch-isolated materialization of a task, with one
/// worktree per participating repo under `container_ref`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Absolute path of the on-disk workspace directory once materialized.
    /// Globally unique while present.
    pub container_ref: Option<String>,
    /// Task branch name shared by every repo worktree in this workspace.
    pub branch: Option<String>,
    pub agent_working_dir: Option<String>,
    pub setup_completed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub pinned: bool,
    /// Display name; derived from the first user prompt when null.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspace {
    pub task_id: Uuid,
    pub repo_id: Uuid,
    pub base_branch: Option<String>,
    pub branch_name: Option<String>,
    pub name: Option<String>,
    pub agent_working_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateWorkspace {
    pub name: Option<String>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub agent_working_dir: Option<String>,
}

impl Workspace {
    pub async fn parent_task(&self, pool: &SqlitePool) -> Result<Option<Task>, sqlx::Error> {
        Task::find_by_id(pool, self.task_id).await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_rowid(pool: &SqlitePool, rowid: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE rowid = $1")
            .bind(rowid)
            .fetch_optional(pool)
            .await
    }

    /// Fetch workspaces, optionally filtered by task and archive state.
    /// Newest first.
    pub async fn fetch_all(
        pool: &SqlitePool,
        task_id: Option<Uuid>,
        archived: Option<bool>,
        limit: Option<i64>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workspace>(
            r#"SELECT * FROM workspaces
               WHERE ($1 IS NULL OR task_id = $1)
                 AND ($2 IS NULL OR archived = $2)
               ORDER BY created_at DESC
               LIMIT COALESCE($3, -1)"#,
        )
        .bind(task_id)
        .bind(archived)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWorkspace,
        workspace_id: Uuid,
    ) -> Result<Self, WorkspaceError> {
        Ok(sqlx::query_as::<_, Workspace>(
            r#"INSERT INTO workspaces (id, task_id, name, agent_working_dir)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(workspace_id)
        .bind(data.task_id)
        .bind(&data.name)
        .bind(&data.agent_working_dir)
        .fetch_one(pool)
        .await?)
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateWorkspace,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Workspace>(
            r#"UPDATE workspaces SET
                name = COALESCE($2, name),
                archived = COALESCE($3, archived),
                pinned = COALESCE($4, pinned),
                agent_working_dir = COALESCE($5, agent_working_dir),
                updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(data.archived)
        .bind(data.pinned)
        .bind(&data.agent_working_dir)
        .fetch_one(pool)
        .await
    }

    pub async fn update_container_ref(
        pool: &SqlitePool,
        id: Uuid,
        container_ref: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspaces SET container_ref = $2, updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .bind(container_ref)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn clear_container_ref(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspaces SET container_ref = NULL, updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_branch(
        pool: &SqlitePool,
        id: Uuid,
        branch: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspaces SET branch = $2, updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .bind(branch)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_setup_completed(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspaces SET setup_completed_at = datetime('now', 'subsec'), updated_at = datetime('now', 'subsec') WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Backfill the display name from the first user prompt, if unnamed.
    pub async fn update_name_if_empty(
        pool: &SqlitePool,
        id: Uuid,
        name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspaces SET name = $2, updated_at = datetime('now', 'subsec') WHERE id = $1 AND name IS NULL",
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn container_ref_exists(
        pool: &SqlitePool,
        container_ref: &str,
    ) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM workspaces WHERE container_ref = $1)",
        )
        .bind(container_ref)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    pub async fn all_container_refs(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT container_ref FROM workspaces")
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().filter_map(|r| r.0).collect())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
