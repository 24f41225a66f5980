use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Per-(process, repo) commit lineage. `before_head_commit` is written when
/// the process starts, `after_head_commit` by the exit monitor; together
/// they drive per-repo diffs and restore resets.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionProcessRepoState {
    pub id: Uuid,
    pub execution_process_id: Uuid,
    pub repo_id: Uuid,
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub merge_commit: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionProcessRepoState {
    pub async fn create(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        repo_id: Uuid,
        before_head_commit: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcessRepoState>(
            r#"INSERT INTO execution_process_repo_states
                 (id, execution_process_id, repo_id, before_head_commit)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (execution_process_id, repo_id)
               DO UPDATE SET before_head_commit = EXCLUDED.before_head_commit
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_process_id)
        .bind(repo_id)
        .bind(before_head_commit)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_execution_process_id(
        pool: &SqlitePool,
        execution_process_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcessRepoState>(
            "SELECT * FROM execution_process_repo_states WHERE execution_process_id = $1",
        )
        .bind(execution_process_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_process_and_repo(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        repo_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcessRepoState>(
            "SELECT * FROM execution_process_repo_states WHERE execution_process_id = $1 AND repo_id = $2",
        )
        .bind(execution_process_id)
        .bind(repo_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_after_head_commit(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        repo_id: Uuid,
        after_head_commit: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE execution_process_repo_states
               SET after_head_commit = $3
               WHERE execution_process_id = $1 AND repo_id = $2"#,
        )
        .bind(execution_process_id)
        .bind(repo_id)
        .bind(after_head_commit)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_before_head_commit(
        pool: &SqlitePool,
        id: Uuid,
        before_head_commit: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE execution_process_repo_states SET before_head_commit = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(before_head_commit)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_merge_commit(
        pool: &SqlitePool,
        execution_process_id: Uuid,
        repo_id: Uuid,
        merge_commit: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE execution_process_repo_states
               SET merge_commit = $3
               WHERE execution_process_id = $1 AND repo_id = $2"#,
        )
        .bind(execution_process_id)
        .bind(repo_id)
        .bind(merge_commit)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Rows whose `before_head_commit` is missing while `after_head_commit`
    /// is known, together with their session. Startup recovery back-fills
    /// these from the previous non-dropped process of the same (session,
    /// repo).
    pub async fn find_missing_before(
        pool: &SqlitePool,
    ) -> Result<Vec<(Self, Uuid)>, sqlx::Error> {
        #[derive(FromRow)]
        struct Row {
            #[sqlx(flatten)]
            state: ExecutionProcessRepoState,
            session_id: Uuid,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"SELECT rs.*, ep.session_id
               FROM execution_process_repo_states rs
               JOIN execution_processes ep ON rs.execution_process_id = ep.id
               WHERE rs.after_head_commit IS NOT NULL
                 AND rs.before_head_commit IS NULL
               ORDER BY ep.created_at ASC"#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.state, r.session_id)).collect())
    }

    /// `after_head_commit` of the latest non-dropped process in the session
    /// that touched this repo, excluding `before_process_id` itself.
    pub async fn previous_after_head_commit(
        pool: &SqlitePool,
        session_id: Uuid,
        repo_id: Uuid,
        before_process_id: Uuid,
    ) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"SELECT rs.after_head_commit
               FROM execution_process_repo_states rs
               JOIN execution_processes ep ON rs.execution_process_id = ep.id
               WHERE ep.session_id = $1
                 AND rs.repo_id = $2
                 AND ep.dropped = FALSE
                 AND ep.id != $3
                 AND rs.after_head_commit IS NOT NULL
                 AND ep.created_at <= (
                     SELECT created_at FROM execution_processes WHERE id = $3
                 )
               ORDER BY ep.created_at DESC
               LIMIT 1"#,
        )
        .bind(session_id)
        .bind(repo_id)
        .bind(before_process_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.and_then(|r| r.0))
    }

    /// Latest non-dropped `after_head_commit` for a (session, repo); the
    /// reset target after a restore.
    pub async fn latest_after_head_commit(
        pool: &SqlitePool,
        session_id: Uuid,
        repo_id: Uuid,
    ) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"SELECT rs.after_head_commit
               FROM execution_process_repo_states rs
               JOIN execution_processes ep ON rs.execution_process_id = ep.id
               WHERE ep.session_id = $1
                 AND rs.repo_id = $2
                 AND ep.dropped = FALSE
                 AND rs.after_head_commit IS NOT NULL
               ORDER BY ep.created_at DESC
               LIMIT 1"#,
        )
        .bind(session_id)
        .bind(repo_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.and_then(|r| r.0))
    }
}
