use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utils::log_msg::LogMsg;
use uuid::Uuid;

/// Durable JSONL mirror of an execution's raw log stream. Appended
/// best-effort while the process runs; the in-memory store is the hot path.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionProcessLogs {
    pub execution_id: Uuid,
    pub logs: String,
    pub byte_size: i64,
    pub inserted_at: DateTime<Utc>,
}

impl ExecutionProcessLogs {
    pub async fn find_by_execution_id(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcessLogs>(
            "SELECT * FROM execution_process_logs WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(pool)
        .await
    }

    /// Parse JSONL logs back into `Vec<LogMsg>`.
    pub fn parse_logs(&self) -> Result<Vec<LogMsg>, serde_json::Error> {
        let mut messages = Vec::new();
        for line in self.logs.lines() {
            if !line.trim().is_empty() {
                messages.push(serde_json::from_str(line)?);
            }
        }
        Ok(messages)
    }

    pub async fn append_log_line(
        pool: &SqlitePool,
        execution_id: Uuid,
        jsonl_line: &str,
    ) -> Result<(), sqlx::Error> {
        let byte_size = jsonl_line.len() as i64;
        sqlx::query(
            r#"INSERT INTO execution_process_logs (execution_id, logs, byte_size, inserted_at)
               VALUES ($1, $2, $3, datetime('now', 'subsec'))
               ON CONFLICT (execution_id) DO UPDATE
               SET logs = logs || $2,
                   byte_size = byte_size + $3,
                   inserted_at = datetime('now', 'subsec')"#,
        )
        .bind(execution_id)
        .bind(jsonl_line)
        .bind(byte_size)
        .execute(pool)
        .await?;
        Ok(())
    }
}
