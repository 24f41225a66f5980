use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::repo::{CreateRepo, Repo, UpdateRepo};
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_repos(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Repo>>>, ApiError> {
    let repos = Repo::find_all(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(repos)))
}

pub async fn get_repo(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Repo>>, ApiError> {
    let repo = Repo::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repo {id} not found")))?;
    Ok(ResponseJson(ApiResponse::success(repo)))
}

pub async fn create_repo(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<CreateRepo>,
) -> Result<ResponseJson<ApiResponse<Repo>>, ApiError> {
    let path = std::path::Path::new(&payload.path);
    if !path.is_absolute() {
        return Err(ApiError::BadRequest("Repo path must be absolute".to_string()));
    }
    if !path.join(".git").exists() {
        return Err(ApiError::BadRequest(format!(
            "{} is not a git repository",
            payload.path
        )));
    }
    if Repo::find_by_path(&deployment.db().pool, &payload.path)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!(
            "A repo at {} is already registered",
            payload.path
        )));
    }

    let repo = Repo::create(&deployment.db().pool, &payload, Uuid::new_v4()).await?;
    Ok(ResponseJson(ApiResponse::success(repo)))
}

pub async fn update_repo(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateRepo>,
) -> Result<ResponseJson<ApiResponse<Repo>>, ApiError> {
    let repo = Repo::update(&deployment.db().pool, id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(repo)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/repos", get(get_repos).post(create_repo))
        .route("/repos/{id}", get(get_repo).put(update_repo))
}
