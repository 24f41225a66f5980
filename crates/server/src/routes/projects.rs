use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    project::{CreateProject, Project, UpdateProject},
    repo::Repo,
};
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_projects(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Project>>>, ApiError> {
    let projects = Project::find_all(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(projects)))
}

pub async fn get_project(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {id} not found")))?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn get_project_repos(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Repo>>>, ApiError> {
    let project = Project::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {id} not found")))?;
    let repos = project.repos(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(repos)))
}

pub async fn create_project(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::create(&deployment.db().pool, &payload, Uuid::new_v4()).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn update_project(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::update(&deployment.db().pool, id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn delete_project(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let deleted = Project::delete(&deployment.db().pool, id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound(format!("Project {id} not found")));
    }
    // Repos that lost their last project link go with it
    Repo::delete_orphaned(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/projects", get(get_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/{id}/repos", get(get_project_repos))
        .route("/projects/{id}/repos/link", post(link_repo))
}

#[derive(serde::Deserialize)]
pub struct LinkRepoRequest {
    pub repo_id: Uuid,
    #[serde(default)]
    pub is_primary: bool,
}

pub async fn link_repo(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<LinkRepoRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Project::link_repo(
        &deployment.db().pool,
        id,
        payload.repo_id,
        payload.is_primary,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}
