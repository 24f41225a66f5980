use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::tag::{CreateTag, Tag};
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_tags(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Tag>>>, ApiError> {
    let tags = Tag::find_all(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(tags)))
}

pub async fn create_tag(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<CreateTag>,
) -> Result<ResponseJson<ApiResponse<Tag>>, ApiError> {
    match Tag::create(&deployment.db().pool, &payload).await {
        Ok(tag) => Ok(ResponseJson(ApiResponse::success(tag))),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(ApiError::Conflict(
            format!("Tag '{}' already exists", payload.name),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_tag(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let deleted = Tag::delete(&deployment.db().pool, id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound(format!("Tag {id} not found")));
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(serde::Deserialize)]
pub struct AttachTagRequest {
    pub task_id: Uuid,
}

pub async fn attach_tag(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<AttachTagRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Tag::attach_to_task(&deployment.db().pool, id, payload.task_id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/tags", get(get_tags).post(create_tag))
        .route("/tags/{id}", axum::routing::delete(delete_tag))
        .route("/tags/{id}/attach", post(attach_tag))
}
