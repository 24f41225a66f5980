use std::path::PathBuf;

use axum::{
    BoxError, Extension, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::{
        Json as ResponseJson, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use db::models::{
    execution_process::{ExecutionProcess, ExecutionProcessStatus},
    merge::Merge,
    repo::Repo,
    session::Session,
    task::Task,
    workspace::{CreateWorkspace, UpdateWorkspace, Workspace},
    workspace_repo::WorkspaceRepo,
};
use deployment::Deployment;
use executors::executors::CodingAgent;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use services::services::{
    container::{ContainerService, FollowUpOutcome},
    git::BranchStatus,
    git_cli::GitCli,
    github::{CreatePrRequest, GitHubService, PullRequestComment, PullRequestInfo},
};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError, middleware::load_workspace_middleware};

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub task_id: Option<Uuid>,
    pub archived: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceWithStatus {
    #[serde(flatten)]
    pub workspace: Workspace,
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    #[serde(rename = "isErrored")]
    pub is_errored: bool,
}

async fn with_status(
    deployment: &DeploymentImpl,
    workspace: Workspace,
) -> Result<WorkspaceWithStatus, ApiError> {
    let processes =
        ExecutionProcess::find_by_workspace_id(&deployment.db().pool, workspace.id).await?;
    let is_running = processes
        .iter()
        .any(|p| p.status == ExecutionProcessStatus::Running);
    let is_errored = processes
        .iter()
        .filter(|p| !p.dropped)
        .next_back()
        .map(|p| matches!(p.status, ExecutionProcessStatus::Failed))
        .unwrap_or(false);

    Ok(WorkspaceWithStatus {
        workspace,
        is_running,
        is_errored,
    })
}

pub async fn get_workspaces(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<WorkspaceWithStatus>>>, ApiError> {
    let workspaces = Workspace::fetch_all(
        &deployment.db().pool,
        query.task_id,
        query.archived,
        query.limit,
    )
    .await?;

    let mut out = Vec::with_capacity(workspaces.len());
    for workspace in workspaces {
        out.push(with_status(&deployment, workspace).await?);
    }
    Ok(ResponseJson(ApiResponse::success(out)))
}

pub async fn create_workspace(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<CreateWorkspace>,
) -> Result<ResponseJson<ApiResponse<WorkspaceWithStatus>>, ApiError> {
    let pool = &deployment.db().pool;

    let task = Task::find_by_id(pool, payload.task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", payload.task_id)))?;
    let project = task
        .parent_project(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".to_string()))?;

    let repos = project.repos(pool).await?;
    if repos.is_empty() {
        return Err(ApiError::BadRequest(
            "Project has no linked repositories".to_string(),
        ));
    }
    if !repos.iter().any(|r| r.id == payload.repo_id) {
        return Err(ApiError::BadRequest(
            "repo_id does not belong to the task's project".to_string(),
        ));
    }

    let workspace = Workspace::create(pool, &payload, Uuid::new_v4()).await?;

    // Every project repo takes part; the requested repo may override its
    // base branch, the rest fall back to their configured default or HEAD.
    for repo in &repos {
        let target_branch = if repo.id == payload.repo_id {
            match &payload.base_branch {
                Some(branch) => branch.clone(),
                None => default_target_branch(&deployment, repo)?,
            }
        } else {
            default_target_branch(&deployment, repo)?
        };
        WorkspaceRepo::create(pool, workspace.id, repo.id, &target_branch).await?;
    }

    if let Some(branch_name) = &payload.branch_name {
        Workspace::update_branch(pool, workspace.id, branch_name).await?;
    }

    let workspace = Workspace::find_by_id(pool, workspace.id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok(ResponseJson(ApiResponse::success(
        with_status(&deployment, workspace).await?,
    )))
}

fn default_target_branch(deployment: &DeploymentImpl, repo: &Repo) -> Result<String, ApiError> {
    if let Some(branch) = &repo.default_target_branch {
        return Ok(branch.clone());
    }
    Ok(deployment
        .git()
        .get_default_branch_name(std::path::Path::new(&repo.path))?)
}

pub async fn get_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<WorkspaceWithStatus>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        with_status(&deployment, workspace).await?,
    )))
}

pub async fn update_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<UpdateWorkspace>,
) -> Result<ResponseJson<ApiResponse<WorkspaceWithStatus>>, ApiError> {
    // Archiving stops anything still running first.
    if payload.archived == Some(true) && !workspace.archived {
        deployment.container().try_stop(&workspace).await;
    }

    let updated = Workspace::update(&deployment.db().pool, workspace.id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(
        with_status(&deployment, updated).await?,
    )))
}

pub async fn delete_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment.container().delete(&workspace).await?;
    Workspace::delete(&deployment.db().pool, workspace.id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize)]
pub struct StartAgentRequest {
    pub prompt: String,
    pub executor: Option<CodingAgent>,
}

/// Kick off the full chain: setup scripts, the initial coding-agent run,
/// then cleanup scripts.
pub async fn run_agent_setup(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<StartAgentRequest>,
) -> Result<ResponseJson<ApiResponse<ExecutionProcess>>, ApiError> {
    if workspace.archived {
        return Err(ApiError::BadRequest(
            "Cannot start executions on an archived workspace".to_string(),
        ));
    }
    if ExecutionProcess::has_running_non_dev_server(&deployment.db().pool, workspace.id).await? {
        return Err(ApiError::Conflict(
            "Another action is already running for this workspace".to_string(),
        ));
    }

    let process = deployment
        .container()
        .start_workspace(
            &workspace,
            payload.prompt,
            payload.executor.unwrap_or_default(),
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

pub async fn run_setup_script(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Option<ExecutionProcess>>>, ApiError> {
    let process = deployment
        .container()
        .run_script_chain(
            &workspace,
            executors::actions::script::ScriptContext::SetupScript,
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

pub async fn run_cleanup_script(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Option<ExecutionProcess>>>, ApiError> {
    let process = deployment
        .container()
        .run_script_chain(
            &workspace,
            executors::actions::script::ScriptContext::CleanupScript,
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

pub async fn run_archive_script(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Option<ExecutionProcess>>>, ApiError> {
    let process = deployment
        .container()
        .run_script_chain(
            &workspace,
            executors::actions::script::ScriptContext::ArchiveScript,
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

#[derive(Debug, Deserialize)]
pub struct FollowUpRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FollowUpResponse {
    Started { execution_process: ExecutionProcess },
    Queued { queued_message_id: Uuid },
}

pub async fn follow_up(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<FollowUpRequest>,
) -> Result<ResponseJson<ApiResponse<FollowUpResponse>>, ApiError> {
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Prompt must not be empty".to_string()));
    }
    let outcome = deployment
        .container()
        .follow_up(&workspace, payload.prompt)
        .await?;
    let response = match outcome {
        FollowUpOutcome::Started(execution_process) => {
            FollowUpResponse::Started { execution_process }
        }
        FollowUpOutcome::Queued(queued_message_id) => {
            FollowUpResponse::Queued { queued_message_id }
        }
    };
    Ok(ResponseJson(ApiResponse::success(response)))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequestBody {
    pub prompt: String,
}

/// Feed review feedback (e.g. collected PR comments) to the agent.
pub async fn start_review(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<ReviewRequestBody>,
) -> Result<ResponseJson<ApiResponse<ExecutionProcess>>, ApiError> {
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("Prompt must not be empty".to_string()));
    }
    if ExecutionProcess::has_running_non_dev_server(&deployment.db().pool, workspace.id).await? {
        return Err(ApiError::Conflict(
            "Another action is already running for this workspace".to_string(),
        ));
    }
    let process = deployment
        .container()
        .start_review(&workspace, payload.prompt)
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

#[derive(Debug, Deserialize)]
pub struct StartDevServerRequest {
    pub repo_id: Option<Uuid>,
}

pub async fn start_dev_server(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<StartDevServerRequest>,
) -> Result<ResponseJson<ApiResponse<ExecutionProcess>>, ApiError> {
    let process = deployment
        .container()
        .start_dev_server(&workspace, payload.repo_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(process)))
}

pub async fn stop_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment.container().try_stop(&workspace).await;
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub execution_process_id: Uuid,
    #[serde(default = "default_true")]
    pub perform_reset: bool,
    #[serde(default)]
    pub force_when_dirty: bool,
}

fn default_true() -> bool {
    true
}

/// Restore the workspace history to just before the given process.
pub async fn restore(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<RestoreRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    if ExecutionProcess::has_running_non_dev_server(&deployment.db().pool, workspace.id).await? {
        return Err(ApiError::Conflict(
            "Cannot restore while an action is running".to_string(),
        ));
    }
    deployment
        .container()
        .restore_to(
            &workspace,
            payload.execution_process_id,
            payload.perform_reset,
            payload.force_when_dirty,
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Serialize)]
pub struct RepoBranchStatus {
    pub repo_id: Uuid,
    pub repo_name: String,
    #[serde(flatten)]
    pub status: BranchStatus,
}

pub async fn branch_status(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<RepoBranchStatus>>>, ApiError> {
    let branch = workspace
        .branch
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no branch yet".to_string()))?;

    let links = WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await?;
    let container_dir = workspace.container_ref.as_ref().map(PathBuf::from);

    let mut out = Vec::with_capacity(links.len());
    for (link, repo) in links {
        let worktree = container_dir.as_ref().map(|dir| dir.join(&repo.name));
        let status = deployment.git().branch_status(
            std::path::Path::new(&repo.path),
            &branch,
            &link.target_branch,
            worktree.as_deref().filter(|p| p.exists()),
        )?;
        out.push(RepoBranchStatus {
            repo_id: repo.id,
            repo_name: repo.name,
            status,
        });
    }
    Ok(ResponseJson(ApiResponse::success(out)))
}

#[derive(Debug, Deserialize, Default)]
pub struct RemoteQuery {
    pub remote: Option<String>,
}

fn reject_non_origin(remote: &Option<String>) -> Result<(), ApiError> {
    match remote.as_deref() {
        None | Some("origin") => Ok(()),
        Some(other) => Err(ApiError::BadRequest(format!(
            "Only the 'origin' remote is supported (got '{other}')"
        ))),
    }
}

pub async fn merge_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Merge>>>, ApiError> {
    let branch = workspace
        .branch
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no branch yet".to_string()))?;
    let task = workspace
        .parent_task(&deployment.db().pool)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;

    let links = WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await?;
    let mut merges = Vec::new();
    for (link, repo) in links {
        let status = deployment.git().branch_status(
            std::path::Path::new(&repo.path),
            &branch,
            &link.target_branch,
            None,
        )?;
        if status.commits_ahead == 0 {
            continue;
        }

        let message = format!("Merge '{}' ({})", task.title, branch);
        let merge_commit = deployment.git().merge_branch(
            std::path::Path::new(&repo.path),
            &branch,
            &link.target_branch,
            &message,
        )?;
        let merge = Merge::create(
            &deployment.db().pool,
            workspace.id,
            repo.id,
            &merge_commit,
            &link.target_branch,
        )
        .await?;
        merges.push(merge);
    }
    Ok(ResponseJson(ApiResponse::success(merges)))
}

pub async fn push_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<RemoteQuery>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    reject_non_origin(&query.remote)?;
    push_inner(&workspace, &deployment, false).await
}

pub async fn push_workspace_force(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<RemoteQuery>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    reject_non_origin(&query.remote)?;
    push_inner(&workspace, &deployment, true).await
}

async fn push_inner(
    workspace: &Workspace,
    deployment: &DeploymentImpl,
    force: bool,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let branch = workspace
        .branch
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no branch yet".to_string()))?;

    let git_cli = GitCli::new();
    for (_, repo) in WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await? {
        git_cli.push(std::path::Path::new(&repo.path), &branch, force)?;
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn rebase_workspace(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let container_dir = workspace
        .container_ref
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::BadRequest("Workspace is not materialized".to_string()))?;

    let git_cli = GitCli::new();
    for (link, repo) in WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await? {
        let worktree = container_dir.join(&repo.name);
        git_cli.rebase_onto(&worktree, &link.target_branch)?;
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn rebase_continue(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let container_dir = workspace
        .container_ref
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::BadRequest("Workspace is not materialized".to_string()))?;

    let git_cli = GitCli::new();
    for (_, repo) in WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await? {
        let worktree = container_dir.join(&repo.name);
        if git_cli.is_rebase_in_progress(&worktree) {
            git_cli.rebase_continue(&worktree)?;
        }
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn conflicts_abort(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let container_dir = workspace
        .container_ref
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::BadRequest("Workspace is not materialized".to_string()))?;

    let git_cli = GitCli::new();
    for (_, repo) in WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await? {
        let worktree = container_dir.join(&repo.name);
        if git_cli.is_rebase_in_progress(&worktree) {
            git_cli.rebase_abort(&worktree)?;
        }
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize)]
pub struct ChangeTargetBranchRequest {
    pub repo_id: Uuid,
    pub target_branch: String,
}

pub async fn change_target_branch(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<ChangeTargetBranchRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let repo = Repo::find_by_id(&deployment.db().pool, payload.repo_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repo {} not found", payload.repo_id)))?;

    if !deployment
        .git()
        .branch_exists(std::path::Path::new(&repo.path), &payload.target_branch)?
    {
        return Err(ApiError::BadRequest(format!(
            "Branch '{}' does not exist in {}",
            payload.target_branch, repo.name
        )));
    }

    WorkspaceRepo::update_target_branch(
        &deployment.db().pool,
        workspace.id,
        payload.repo_id,
        &payload.target_branch,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize)]
pub struct RenameBranchRequest {
    pub new_name: String,
}

pub async fn rename_branch(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<RenameBranchRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let old_branch = workspace
        .branch
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no branch yet".to_string()))?;

    for (_, repo) in WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await? {
        deployment.git().rename_branch(
            std::path::Path::new(&repo.path),
            &old_branch,
            &payload.new_name,
        )?;
    }
    Workspace::update_branch(&deployment.db().pool, workspace.id, &payload.new_name).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

async fn github_service_for(
    deployment: &DeploymentImpl,
) -> Result<GitHubService, ApiError> {
    let token = deployment.config().read().await.github.token.clone();
    Ok(GitHubService::new(token.as_deref())?)
}

fn primary_remote_coords(repo: &Repo) -> Result<(String, String), ApiError> {
    let output = GitCli::new().git(
        std::path::Path::new(&repo.path),
        ["remote", "get-url", "origin"],
    )?;
    Ok(GitHubService::parse_remote(output.trim())?)
}

pub async fn create_pr(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<RemoteQuery>,
    axum::Json(payload): axum::Json<CreatePrRequest>,
) -> Result<ResponseJson<ApiResponse<PullRequestInfo>>, ApiError> {
    reject_non_origin(&query.remote)?;
    let branch = workspace
        .branch
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no branch yet".to_string()))?;

    let links = WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await?;
    let (link, repo) = links
        .first()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no repos".to_string()))?;

    // The branch must exist on the remote before a PR can reference it.
    GitCli::new().push(std::path::Path::new(&repo.path), &branch, false)?;

    let (owner, repo_name) = primary_remote_coords(repo)?;
    let base = payload
        .base_branch
        .clone()
        .unwrap_or_else(|| link.target_branch.clone());

    let service = github_service_for(&deployment).await?;
    let pr = service
        .create_pr(
            &owner,
            &repo_name,
            &branch,
            &base,
            &payload.title,
            payload.body.as_deref(),
        )
        .await?;
    Ok(ResponseJson(ApiResponse::success(pr)))
}

#[derive(Debug, Deserialize)]
pub struct AttachPrRequest {
    pub number: u64,
}

pub async fn attach_pr(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<AttachPrRequest>,
) -> Result<ResponseJson<ApiResponse<PullRequestInfo>>, ApiError> {
    let links = WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await?;
    let (_, repo) = links
        .first()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no repos".to_string()))?;

    let (owner, repo_name) = primary_remote_coords(repo)?;
    let service = github_service_for(&deployment).await?;
    let pr = service.get_pr(&owner, &repo_name, payload.number).await?;
    Ok(ResponseJson(ApiResponse::success(pr)))
}

#[derive(Debug, Deserialize)]
pub struct PrCommentsQuery {
    pub number: u64,
}

pub async fn pr_comments(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<PrCommentsQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<PullRequestComment>>>, ApiError> {
    let links = WorkspaceRepo::find_with_repos(&deployment.db().pool, workspace.id).await?;
    let (_, repo) = links
        .first()
        .ok_or_else(|| ApiError::BadRequest("Workspace has no repos".to_string()))?;

    let (owner, repo_name) = primary_remote_coords(repo)?;
    let service = github_service_for(&deployment).await?;
    let comments = service
        .list_pr_comments(&owner, &repo_name, query.number)
        .await?;
    Ok(ResponseJson(ApiResponse::success(comments)))
}

pub async fn stream_diff(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, ApiError> {
    let stream = deployment.container().get_diff(&workspace).await?;
    Ok(Sse::new(stream.map_err(|e| -> BoxError { e.into() })).keep_alive(KeepAlive::default()))
}

pub async fn stream_workspaces(
    State(deployment): State<DeploymentImpl>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, ApiError> {
    let stream = deployment.events().stream_workspaces().await.map_err(|e| {
        ApiError::BadRequest(format!("Failed to open workspace stream: {e}"))
    })?;
    Ok(Sse::new(stream.map_err(|e| -> BoxError { e.into() })).keep_alive(KeepAlive::default()))
}

pub async fn get_sessions(
    Extension(workspace): Extension<Workspace>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Session>>>, ApiError> {
    let sessions = Session::find_by_workspace_id(&deployment.db().pool, workspace.id).await?;
    Ok(ResponseJson(ApiResponse::success(sessions)))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let workspace_id_router = Router::new()
        .route(
            "/",
            get(get_workspace)
                .put(update_workspace)
                .delete(delete_workspace),
        )
        .route("/run-agent-setup", post(run_agent_setup))
        .route("/run-setup-script", post(run_setup_script))
        .route("/run-cleanup-script", post(run_cleanup_script))
        .route("/run-archive-script", post(run_archive_script))
        .route("/follow-up", post(follow_up))
        .route("/review", post(start_review))
        .route("/start-dev-server", post(start_dev_server))
        .route("/stop", post(stop_workspace))
        .route("/restore", post(restore))
        .route("/branch-status", get(branch_status))
        .route("/merge", post(merge_workspace))
        .route("/push", post(push_workspace))
        .route("/push/force", post(push_workspace_force))
        .route("/rebase", post(rebase_workspace))
        .route("/rebase/continue", post(rebase_continue))
        .route("/conflicts/abort", post(conflicts_abort))
        .route("/change-target-branch", post(change_target_branch))
        .route("/rename-branch", post(rename_branch))
        .route("/pr", post(create_pr))
        .route("/pr/attach", post(attach_pr))
        .route("/pr/comments", get(pr_comments))
        .route("/sessions", get(get_sessions))
        .route("/diff", get(stream_diff))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_workspace_middleware,
        ));

    Router::new()
        .route("/task-attempts", get(get_workspaces).post(create_workspace))
        .route("/task-attempts/stream", get(stream_workspaces))
        .nest("/task-attempts/{id}", workspace_id_router)
}
