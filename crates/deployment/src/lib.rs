use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        execution_process::ExecutionProcess,
        execution_process_repo_state::ExecutionProcessRepoState,
        workspace::{Workspace, WorkspaceError},
    },
};
use executors::executors::ExecutorError;
use git2::Error as Git2Error;
use services::services::{
    approvals::{ApprovalBroker, ApprovalError},
    config::{Config, ConfigError},
    container::{ContainerError, ContainerService},
    events::{EventError, EventService},
    filesystem_watcher::FilesystemWatcherError,
    git::{GitService, GitServiceError},
    workspace_manager::{WorkspaceError as WorkspaceManagerError, WorkspaceManager},
    worktree_manager::WorktreeError,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Git2(#[from] Git2Error),
    #[error(transparent)]
    GitServiceError(#[from] GitServiceError),
    #[error(transparent)]
    FilesystemWatcherError(#[from] FilesystemWatcherError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    WorkspaceManager(#[from] WorkspaceManagerError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Root handle tying together persistence, the engine, and the streaming
/// services. All live state hangs off this; there are no process-wide
/// singletons besides the worktree path locks.
#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<RwLock<Config>>;

    fn db(&self) -> &DBService;

    fn container(&self) -> &impl ContainerService;

    fn git(&self) -> &GitService;

    fn events(&self) -> &EventService;

    fn approvals(&self) -> &ApprovalBroker;

    /// Startup reconciliation, run before the first external request.
    ///
    /// 1. Rows still `running` cannot have a live child attached to this
    ///    process; rewrite them to `killed`.
    /// 2. Back-fill missing `before_head_commit` values from the previous
    ///    non-dropped process of the same (session, repo).
    /// 3. Sweep workspace directories no live workspace claims.
    async fn recover(&self) -> Result<(), DeploymentError> {
        let killed = ExecutionProcess::mark_running_as_killed(&self.db().pool).await?;
        if killed > 0 {
            tracing::info!("Recovery: marked {killed} interrupted execution processes as killed");
        }

        self.backfill_commit_lineage().await?;

        let container_refs: HashSet<String> =
            Workspace::all_container_refs(&self.db().pool).await?.into_iter().collect();
        WorkspaceManager::orphan_sweep(&utils::assets::workspace_base_dir(), &container_refs).await;

        Ok(())
    }

    async fn backfill_commit_lineage(&self) -> Result<(), DeploymentError> {
        let missing = ExecutionProcessRepoState::find_missing_before(&self.db().pool).await?;
        for (state, session_id) in missing {
            let previous = ExecutionProcessRepoState::previous_after_head_commit(
                &self.db().pool,
                session_id,
                state.repo_id,
                state.execution_process_id,
            )
            .await?;

            if let Some(commit) = previous {
                ExecutionProcessRepoState::update_before_head_commit(
                    &self.db().pool,
                    state.id,
                    &commit,
                )
                .await?;
                tracing::debug!(
                    "Back-filled before_head_commit for process {} repo {}",
                    state.execution_process_id,
                    state.repo_id
                );
            }
        }
        Ok(())
    }

}
