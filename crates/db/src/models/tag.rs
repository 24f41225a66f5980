use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTag {
    pub name: String,
    pub color: Option<String>,
}

impl Tag {
    pub async fn create(pool: &SqlitePool, data: &CreateTag) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Tag>(
            "INSERT INTO tags (id, name, color) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&data.name)
        .bind(&data.color)
        .fetch_one(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Tag>("SELECT * FROM tags ORDER BY name ASC")
            .fetch_all(pool)
            .await
    }

    pub async fn find_by_task_id(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Tag>(
            r#"SELECT t.* FROM tags t
               JOIN task_tags tt ON tt.tag_id = t.id
               WHERE tt.task_id = $1
               ORDER BY t.name ASC"#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn attach_to_task(
        pool: &SqlitePool,
        tag_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO task_tags (task_id, tag_id) VALUES ($1, $2)")
            .bind(task_id)
            .bind(tag_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tags WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
