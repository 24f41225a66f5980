use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    /// Absolute path of the local git directory; unique across repos.
    pub path: String,
    pub name: String,
    pub setup_script: Option<String>,
    pub cleanup_script: Option<String>,
    pub archive_script: Option<String>,
    pub dev_server_script: Option<String>,
    pub parallel_setup_script: bool,
    pub default_target_branch: Option<String>,
    pub default_working_dir: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRepo {
    pub path: String,
    pub name: String,
    pub setup_script: Option<String>,
    pub cleanup_script: Option<String>,
    pub archive_script: Option<String>,
    pub dev_server_script: Option<String>,
    #[serde(default)]
    pub parallel_setup_script: bool,
    pub default_target_branch: Option<String>,
    pub default_working_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateRepo {
    pub name: Option<String>,
    pub setup_script: Option<String>,
    pub cleanup_script: Option<String>,
    pub archive_script: Option<String>,
    pub dev_server_script: Option<String>,
    pub parallel_setup_script: Option<bool>,
    pub default_target_branch: Option<String>,
    pub default_working_dir: Option<String>,
}

impl Repo {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>("SELECT * FROM repos WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_path(pool: &SqlitePool, path: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>("SELECT * FROM repos WHERE path = $1")
            .bind(path)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Repo>("SELECT * FROM repos ORDER BY name ASC")
            .fetch_all(pool)
            .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateRepo,
        repo_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Repo>(
            r#"INSERT INTO repos (
                id, path, name, setup_script, cleanup_script, archive_script,
                dev_server_script, parallel_setup_script, default_target_branch,
                default_working_dir
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING *"#,
        )
        .bind(repo_id)
        .bind(&data.path)
        .bind(&data.name)
        .bind(&data.setup_script)
        .bind(&data.cleanup_script)
        .bind(&data.archive_script)
        .bind(&data.dev_server_script)
        .bind(data.parallel_setup_script)
        .bind(&data.default_target_branch)
        .bind(&data.default_working_dir)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateRepo,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Repo>(
            r#"UPDATE repos SET
                name = COALESCE($2, name),
                setup_script = COALESCE($3, setup_script),
                cleanup_script = COALESCE($4, cleanup_script),
                archive_script = COALESCE($5, archive_script),
                dev_server_script = COALESCE($6, dev_server_script),
                parallel_setup_script = COALESCE($7, parallel_setup_script),
                default_target_branch = COALESCE($8, default_target_branch),
                default_working_dir = COALESCE($9, default_working_dir),
                updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.setup_script)
        .bind(&data.cleanup_script)
        .bind(&data.archive_script)
        .bind(&data.dev_server_script)
        .bind(data.parallel_setup_script)
        .bind(&data.default_target_branch)
        .bind(&data.default_working_dir)
        .fetch_one(pool)
        .await
    }

    /// Delete repos no project links anymore.
    pub async fn delete_orphaned(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM repos WHERE id NOT IN (SELECT repo_id FROM project_repos)",
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
