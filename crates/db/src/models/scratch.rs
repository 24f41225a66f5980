use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Free-form client-side draft state (e.g. unsent follow-up text).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Scratch {
    pub id: Uuid,
    pub kind: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scratch {
    pub async fn upsert(
        pool: &SqlitePool,
        id: Uuid,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        let payload_json =
            serde_json::to_string(payload).map_err(|e| sqlx::Error::Encode(e.into()))?;
        sqlx::query_as::<_, Scratch>(
            r#"INSERT INTO scratch (id, kind, payload)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET payload = EXCLUDED.payload, updated_at = datetime('now', 'subsec')
               RETURNING *"#,
        )
        .bind(id)
        .bind(kind)
        .bind(payload_json)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Scratch>("SELECT * FROM scratch WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_kind(pool: &SqlitePool, kind: &str) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Scratch>(
            "SELECT * FROM scratch WHERE kind = $1 ORDER BY updated_at DESC",
        )
        .bind(kind)
        .fetch_all(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM scratch WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
