use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    image::TaskImage,
    task::{CreateTask, Task, UpdateTask},
};
use deployment::Deployment;
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub project_id: Uuid,
}

pub async fn get_tasks(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<TaskQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = Task::find_by_project_id(&deployment.db().pool, query.project_id).await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn get_task(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = Task::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {id} not found")))?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn create_task(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<CreateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Task title must not be empty".to_string()));
    }
    let task = Task::create(&deployment.db().pool, &payload, Uuid::new_v4()).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn update_task(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    Task::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {id} not found")))?;
    let task = Task::update(&deployment.db().pool, id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn delete_task(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let deleted = Task::delete(&deployment.db().pool, id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound(format!("Task {id} not found")));
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize)]
pub struct AttachImageRequest {
    pub file_path: String,
}

pub async fn attach_image(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<AttachImageRequest>,
) -> Result<ResponseJson<ApiResponse<TaskImage>>, ApiError> {
    Task::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {id} not found")))?;
    if !std::path::Path::new(&payload.file_path).is_file() {
        return Err(ApiError::BadRequest(format!(
            "{} is not a readable file",
            payload.file_path
        )));
    }
    let image = TaskImage::create(&deployment.db().pool, id, &payload.file_path).await?;
    Ok(ResponseJson(ApiResponse::success(image)))
}

pub async fn get_images(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskImage>>>, ApiError> {
    let images = TaskImage::find_by_task_id(&deployment.db().pool, id).await?;
    Ok(ResponseJson(ApiResponse::success(images)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/tasks", get(get_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/images", get(get_images).post(attach_image))
}
