use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Image attachment on a task; `file_path` points into the data directory
/// cache and is copied into each workspace on materialization.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskImage {
    pub id: Uuid,
    pub task_id: Uuid,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

impl TaskImage {
    pub async fn create(
        pool: &SqlitePool,
        task_id: Uuid,
        file_path: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, TaskImage>(
            "INSERT INTO task_images (id, task_id, file_path) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(file_path)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, TaskImage>(
            "SELECT * FROM task_images WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM task_images WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
