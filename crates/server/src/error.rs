use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{project::ProjectError, workspace::WorkspaceError};
use deployment::DeploymentError;
use executors::executors::ExecutorError;
use git2::Error as Git2Error;
use services::services::{
    approvals::ApprovalError,
    config::ConfigError,
    container::ContainerError,
    git::GitServiceError,
    git_cli::GitCliError,
    github::GitHubServiceError,
    workspace_manager::WorkspaceError as WorkspaceManagerError,
    worktree_manager::WorktreeError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    WorkspaceManager(#[from] WorkspaceManagerError),
    #[error(transparent)]
    GitService(#[from] GitServiceError),
    #[error(transparent)]
    GitCli(#[from] GitCliError),
    #[error(transparent)]
    GitHub(#[from] GitHubServiceError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
}

impl From<Git2Error> for ApiError {
    fn from(err: Git2Error) -> Self {
        ApiError::GitService(GitServiceError::from(err))
    }
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "InvalidInput"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Database(sqlx::Error::RowNotFound) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Workspace(WorkspaceError::WorkspaceNotFound)
            | ApiError::Workspace(WorkspaceError::TaskNotFound) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            ApiError::Workspace(WorkspaceError::ValidationError(_)) => {
                (StatusCode::BAD_REQUEST, "WorkspaceError")
            }
            ApiError::Project(ProjectError::ProjectNotFound) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Project(ProjectError::NoRepos) => {
                (StatusCode::BAD_REQUEST, "ProjectError")
            }
            ApiError::Approval(ApprovalError::NotFound) => (StatusCode::NOT_FOUND, "ApprovalError"),
            ApiError::Approval(ApprovalError::AlreadyCompleted) => {
                (StatusCode::CONFLICT, "ApprovalError")
            }
            ApiError::Approval(ApprovalError::NoToolUseEntry) => {
                (StatusCode::CONFLICT, "ApprovalError")
            }
            ApiError::Container(ContainerError::ChainBusy) => {
                (StatusCode::CONFLICT, "ContainerError")
            }
            ApiError::WorkspaceManager(WorkspaceManagerError::PartialCreation { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PartialCreation")
            }
            ApiError::GitCli(e) => match e {
                GitCliError::RebaseInProgress => (StatusCode::CONFLICT, "GitCliError"),
                GitCliError::AuthFailed(_) => (StatusCode::BAD_GATEWAY, "GitCliError"),
                GitCliError::PushRejected(_) => (StatusCode::CONFLICT, "GitCliError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "GitCliError"),
            },
            ApiError::GitHub(GitHubServiceError::TokenMissing) => {
                (StatusCode::BAD_REQUEST, "GitHubServiceError")
            }
            ApiError::GitService(GitServiceError::MergeConflicts(_)) => {
                (StatusCode::CONFLICT, "GitServiceError")
            }
            ApiError::GitService(GitServiceError::BranchNotFound(_)) => {
                (StatusCode::NOT_FOUND, "GitServiceError")
            }
            ApiError::Project(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ProjectError"),
            ApiError::Workspace(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WorkspaceError"),
            ApiError::GitService(_) => (StatusCode::INTERNAL_SERVER_ERROR, "GitServiceError"),
            ApiError::GitHub(_) => (StatusCode::INTERNAL_SERVER_ERROR, "GitHubServiceError"),
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Container(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ContainerError"),
            ApiError::Executor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ExecutorError"),
            ApiError::Approval(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ApprovalError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Worktree(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WorktreeError"),
            ApiError::WorkspaceManager(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "WorkspaceManagerError")
            }
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IoError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status_and_type();
        let error_message = format!("{error_type}: {self}");
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
