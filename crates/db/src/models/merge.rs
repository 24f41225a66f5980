use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Record of a workspace branch merged into a repo's target branch.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Merge {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub repo_id: Uuid,
    pub merge_commit: String,
    pub target_branch: String,
    pub created_at: DateTime<Utc>,
}

impl Merge {
    pub async fn create(
        pool: &SqlitePool,
        workspace_id: Uuid,
        repo_id: Uuid,
        merge_commit: &str,
        target_branch: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Merge>(
            r#"INSERT INTO merges (id, workspace_id, repo_id, merge_commit, target_branch)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(repo_id)
        .bind(merge_commit)
        .bind(target_branch)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Merge>(
            "SELECT * FROM merges WHERE workspace_id = $1 ORDER BY created_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_latest_by_workspace_and_repo(
        pool: &SqlitePool,
        workspace_id: Uuid,
        repo_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Merge>(
            r#"SELECT * FROM merges
               WHERE workspace_id = $1 AND repo_id = $2
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(workspace_id)
        .bind(repo_id)
        .fetch_optional(pool)
        .await
    }
}
