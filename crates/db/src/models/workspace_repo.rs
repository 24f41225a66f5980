use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use super::repo::Repo;

/// Link row tying a repo into a workspace with its base branch and, once
/// materialized, the worktree location inside the container directory.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkspaceRepo {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub repo_id: Uuid,
    pub target_branch: String,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceRepo {
    pub async fn create(
        pool: &SqlitePool,
        workspace_id: Uuid,
        repo_id: Uuid,
        target_branch: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, WorkspaceRepo>(
            r#"INSERT INTO workspace_repos (id, workspace_id, repo_id, target_branch)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(repo_id)
        .bind(target_branch)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkspaceRepo>(
            "SELECT * FROM workspace_repos WHERE workspace_id = $1 ORDER BY created_at ASC",
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_with_repos(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<(Self, Repo)>, sqlx::Error> {
        let links = Self::find_by_workspace_id(pool, workspace_id).await?;
        let mut out = Vec::with_capacity(links.len());
        for link in links {
            if let Some(repo) = Repo::find_by_id(pool, link.repo_id).await? {
                out.push((link, repo));
            }
        }
        Ok(out)
    }

    pub async fn update_worktree_path(
        pool: &SqlitePool,
        workspace_id: Uuid,
        repo_id: Uuid,
        worktree_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspace_repos SET worktree_path = $3 WHERE workspace_id = $1 AND repo_id = $2",
        )
        .bind(workspace_id)
        .bind(repo_id)
        .bind(worktree_path)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_target_branch(
        pool: &SqlitePool,
        workspace_id: Uuid,
        repo_id: Uuid,
        target_branch: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE workspace_repos SET target_branch = $3 WHERE workspace_id = $1 AND repo_id = $2",
        )
        .bind(workspace_id)
        .bind(repo_id)
        .bind(target_branch)
        .execute(pool)
        .await?;
        Ok(())
    }
}
