use chrono::{DateTime, Utc};
use executors::actions::ExecutorAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

use super::{session::Session, task::Task, workspace::Workspace};

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "execution_process_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionProcessStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "execution_process_run_reason", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProcessRunReason {
    SetupScript,
    CleanupScript,
    ArchiveScript,
    CodingAgent,
    DevServer,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_reason: ExecutionProcessRunReason,
    pub executor_action: sqlx::types::Json<ExecutorActionField>,
    pub status: ExecutionProcessStatus,
    pub exit_code: Option<i64>,
    /// Excluded from the current history view (restore/trim); the row and
    /// its log mirror are retained.
    pub dropped: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CreateExecutionProcess {
    pub session_id: Uuid,
    pub executor_action: ExecutorAction,
    pub run_reason: ExecutionProcessRunReason,
}

/// Full ancestry of a process, loaded together for the exit monitor.
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_process: ExecutionProcess,
    pub session: Session,
    pub workspace: Workspace,
    pub task: Task,
}

/// The stored action JSON is kept verbatim even when its tag is unknown to
/// this build, so it can still be displayed for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutorActionField {
    ExecutorAction(ExecutorAction),
    Other(Value),
}

impl ExecutionProcess {
    pub fn executor_action(&self) -> Result<&ExecutorAction, anyhow::Error> {
        match &self.executor_action.0 {
            ExecutorActionField::ExecutorAction(action) => Ok(action),
            ExecutorActionField::Other(raw) => Err(anyhow::anyhow!(
                "executor_action carries an unknown tag: {raw}"
            )),
        }
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>("SELECT * FROM execution_processes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_rowid(pool: &SqlitePool, rowid: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>("SELECT * FROM execution_processes WHERE rowid = $1")
            .bind(rowid)
            .fetch_optional(pool)
            .await
    }

    /// Processes of a session in chain order. Dropped rows are excluded
    /// unless `show_dropped` is set (the Processes tab passes true).
    pub async fn find_by_session_id(
        pool: &SqlitePool,
        session_id: Uuid,
        show_dropped: bool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(
            r#"SELECT * FROM execution_processes
               WHERE session_id = $1 AND (dropped = FALSE OR $2)
               ORDER BY created_at ASC"#,
        )
        .bind(session_id)
        .bind(show_dropped)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(
            r#"SELECT ep.* FROM execution_processes ep
               JOIN sessions s ON ep.session_id = s.id
               WHERE s.workspace_id = $1
               ORDER BY ep.created_at ASC"#,
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_running(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(
            "SELECT * FROM execution_processes WHERE status = 'running' ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_running_by_workspace_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(
            r#"SELECT ep.* FROM execution_processes ep
               JOIN sessions s ON ep.session_id = s.id
               WHERE s.workspace_id = $1 AND ep.status = 'running'
               ORDER BY ep.created_at ASC"#,
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    /// Running processes of the workspace that take part in the action
    /// chain; dev servers do not gate finalization.
    pub async fn has_running_non_dev_server(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(
                 SELECT 1 FROM execution_processes ep
                 JOIN sessions s ON ep.session_id = s.id
                 WHERE s.workspace_id = $1
                   AND ep.status = 'running'
                   AND ep.run_reason != 'devserver'
               )"#,
        )
        .bind(workspace_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    pub async fn find_latest_by_session_id(
        pool: &SqlitePool,
        session_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(
            r#"SELECT * FROM execution_processes
               WHERE session_id = $1 AND dropped = FALSE
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateExecutionProcess,
        process_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let executor_action_json =
            serde_json::to_string(&data.executor_action).map_err(|e| sqlx::Error::Encode(e.into()))?;

        sqlx::query_as::<_, ExecutionProcess>(
            r#"INSERT INTO execution_processes (id, session_id, run_reason, executor_action, status)
               VALUES ($1, $2, $3, $4, 'running')
               RETURNING *"#,
        )
        .bind(process_id)
        .bind(data.session_id)
        .bind(data.run_reason)
        .bind(executor_action_json)
        .fetch_one(pool)
        .await
    }

    pub async fn was_killed(pool: &SqlitePool, id: Uuid) -> bool {
        matches!(
            Self::find_by_id(pool, id).await,
            Ok(Some(process)) if process.status == ExecutionProcessStatus::Killed
        )
    }

    /// Persist terminal state. Terminal rows are never reopened: once a
    /// process left `running`, later updates are ignored.
    pub async fn update_completion(
        pool: &SqlitePool,
        id: Uuid,
        status: ExecutionProcessStatus,
        exit_code: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE execution_processes
               SET status = $2,
                   exit_code = $3,
                   completed_at = datetime('now', 'subsec'),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1 AND status = 'running'"#,
        )
        .bind(id)
        .bind(status)
        .bind(exit_code)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Startup recovery: no live child can be attached to a `running` row
    /// after a restart, so rewrite them all to `killed`.
    pub async fn mark_running_as_killed(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE execution_processes
               SET status = 'killed',
                   exit_code = NULL,
                   completed_at = datetime('now', 'subsec'),
                   updated_at = datetime('now', 'subsec')
               WHERE status = 'running'"#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Restore-to-point: soft-delete the boundary process and everything
    /// after it in the same session. Earlier rows are untouched.
    pub async fn drop_at_and_after(
        pool: &SqlitePool,
        session_id: Uuid,
        boundary_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE execution_processes
               SET dropped = TRUE, updated_at = datetime('now', 'subsec')
               WHERE session_id = $1
                 AND (id = $2 OR created_at > (
                     SELECT created_at FROM execution_processes WHERE id = $2
                 ))"#,
        )
        .bind(session_id)
        .bind(boundary_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn parent_session(&self, pool: &SqlitePool) -> Result<Option<Session>, sqlx::Error> {
        Session::find_by_id(pool, self.session_id).await
    }

    pub async fn load_context(
        pool: &SqlitePool,
        exec_id: Uuid,
    ) -> Result<ExecutionContext, sqlx::Error> {
        let execution_process = Self::find_by_id(pool, exec_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let session = Session::find_by_id(pool, execution_process.session_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let workspace = Workspace::find_by_id(pool, session.workspace_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let task = Task::find_by_id(pool, workspace.task_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        Ok(ExecutionContext {
            execution_process,
            session,
            workspace,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        DBService,
        models::{
            project::{CreateProject, Project},
            repo::{CreateRepo, Repo},
            task::CreateTask,
            workspace::{CreateWorkspace, Workspace},
        },
    };

    async fn setup_pool() -> (SqlitePool, TempDir) {
        let td = TempDir::new().expect("temp dir");
        let db = DBService::new(&td.path().join("test.db"))
            .await
            .expect("db with migrations");
        (db.pool, td)
    }

    async fn seed_session(pool: &SqlitePool) -> Uuid {
        let repo = Repo::create(
            pool,
            &CreateRepo {
                path: format!("/tmp/repo-{}", Uuid::new_v4()),
                name: "repo".to_string(),
                setup_script: None,
                cleanup_script: None,
                archive_script: None,
                dev_server_script: None,
                parallel_setup_script: false,
                default_target_branch: None,
                default_working_dir: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        let project = Project::create(
            pool,
            &CreateProject {
                name: "p".to_string(),
                repo_ids: vec![repo.id],
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        let task = Task::create(
            pool,
            &CreateTask {
                project_id: project.id,
                title: "t".to_string(),
                description: None,
                parent_workspace_id: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        let workspace = Workspace::create(
            pool,
            &CreateWorkspace {
                task_id: task.id,
                repo_id: repo.id,
                base_branch: None,
                branch_name: None,
                name: None,
                agent_working_dir: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        Session::create(pool, workspace.id, Uuid::new_v4())
            .await
            .unwrap()
            .id
    }

    async fn insert_process(pool: &SqlitePool, session_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO execution_processes (id, session_id, status, run_reason, executor_action)
               VALUES ($1, $2, 'running', 'codingagent', '{}')"#,
        )
        .bind(id)
        .bind(session_id)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn update_completion_never_reopens_terminal_rows() {
        let (pool, _td) = setup_pool().await;
        let session_id = seed_session(&pool).await;
        let id = insert_process(&pool, session_id).await;

        ExecutionProcess::update_completion(&pool, id, ExecutionProcessStatus::Killed, None)
            .await
            .unwrap();
        // A late exit-monitor write must not override the explicit kill
        ExecutionProcess::update_completion(&pool, id, ExecutionProcessStatus::Completed, Some(0))
            .await
            .unwrap();

        let process = ExecutionProcess::find_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(process.status, ExecutionProcessStatus::Killed);
        assert_eq!(process.exit_code, None);
        assert!(process.completed_at.is_some());
    }

    #[tokio::test]
    async fn drop_at_and_after_spares_earlier_processes() {
        let (pool, _td) = setup_pool().await;
        let session_id = seed_session(&pool).await;

        let p1 = insert_process(&pool, session_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let p2 = insert_process(&pool, session_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let p3 = insert_process(&pool, session_id).await;

        ExecutionProcess::drop_at_and_after(&pool, session_id, p2)
            .await
            .unwrap();

        let visible = ExecutionProcess::find_by_session_id(&pool, session_id, false)
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, p1);

        let all = ExecutionProcess::find_by_session_id(&pool, session_id, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(!all.iter().find(|p| p.id == p1).unwrap().dropped);
        assert!(all.iter().find(|p| p.id == p2).unwrap().dropped);
        assert!(all.iter().find(|p| p.id == p3).unwrap().dropped);
    }

    #[tokio::test]
    async fn latest_by_session_skips_dropped() {
        let (pool, _td) = setup_pool().await;
        let session_id = seed_session(&pool).await;

        let p1 = insert_process(&pool, session_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let p2 = insert_process(&pool, session_id).await;

        ExecutionProcess::drop_at_and_after(&pool, session_id, p2)
            .await
            .unwrap();

        let latest = ExecutionProcess::find_latest_by_session_id(&pool, session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, p1);
    }

    #[tokio::test]
    async fn unknown_action_tag_is_preserved_but_rejected() {
        let (pool, _td) = setup_pool().await;
        let session_id = seed_session(&pool).await;

        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO execution_processes (id, session_id, status, run_reason, executor_action)
               VALUES ($1, $2, 'running', 'codingagent', '{"typ":{"type":"FutureAction"},"next_action":null}')"#,
        )
        .bind(id)
        .bind(session_id)
        .execute(&pool)
        .await
        .unwrap();

        let process = ExecutionProcess::find_by_id(&pool, id).await.unwrap().unwrap();
        let err = process.executor_action().unwrap_err();
        assert!(err.to_string().contains("unknown tag"));
    }
}
