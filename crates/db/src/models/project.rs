use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::repo::Repo;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Project must link at least one repository")]
    NoRepos,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProjectRepo {
    pub id: Uuid,
    pub project_id: Uuid,
    pub repo_id: Uuid,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub repo_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
}

impl Project {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        project_id: Uuid,
    ) -> Result<Self, ProjectError> {
        if data.repo_ids.is_empty() {
            return Err(ProjectError::NoRepos);
        }

        let project = sqlx::query_as::<_, Project>(
            "INSERT INTO projects (id, name) VALUES ($1, $2) RETURNING *",
        )
        .bind(project_id)
        .bind(&data.name)
        .fetch_one(pool)
        .await?;

        for (i, repo_id) in data.repo_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO project_repos (id, project_id, repo_id, is_primary) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(project_id)
            .bind(repo_id)
            .bind(i == 0)
            .execute(pool)
            .await?;
        }

        Ok(project)
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateProject,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"UPDATE projects
               SET name = COALESCE($2, name), updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(&data.name)
        .fetch_one(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Repos linked to this project, primary first then link order.
    pub async fn repos(&self, pool: &SqlitePool) -> Result<Vec<Repo>, sqlx::Error> {
        sqlx::query_as::<_, Repo>(
            r#"SELECT r.*
               FROM repos r
               JOIN project_repos pr ON pr.repo_id = r.id
               WHERE pr.project_id = $1
               ORDER BY pr.is_primary DESC, pr.created_at ASC"#,
        )
        .bind(self.id)
        .fetch_all(pool)
        .await
    }

    pub async fn link_repo(
        pool: &SqlitePool,
        project_id: Uuid,
        repo_id: Uuid,
        is_primary: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO project_repos (id, project_id, repo_id, is_primary) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(repo_id)
        .bind(is_primary)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn unlink_repo(
        pool: &SqlitePool,
        project_id: Uuid,
        repo_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM project_repos WHERE project_id = $1 AND repo_id = $2")
            .bind(project_id)
            .bind(repo_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
