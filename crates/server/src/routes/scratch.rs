use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::scratch::Scratch;
use deployment::Deployment;
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ScratchQuery {
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct UpsertScratchRequest {
    pub id: Option<Uuid>,
    pub kind: String,
    pub payload: serde_json::Value,
}

pub async fn get_scratch(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<ScratchQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Scratch>>>, ApiError> {
    let entries = Scratch::find_by_kind(&deployment.db().pool, &query.kind).await?;
    Ok(ResponseJson(ApiResponse::success(entries)))
}

pub async fn upsert_scratch(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<UpsertScratchRequest>,
) -> Result<ResponseJson<ApiResponse<Scratch>>, ApiError> {
    let id = payload.id.unwrap_or_else(Uuid::new_v4);
    let entry =
        Scratch::upsert(&deployment.db().pool, id, &payload.kind, &payload.payload).await?;
    Ok(ResponseJson(ApiResponse::success(entry)))
}

pub async fn delete_scratch(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let deleted = Scratch::delete(&deployment.db().pool, id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound(format!("Scratch {id} not found")));
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/scratch", get(get_scratch).post(upsert_scratch))
        .route("/scratch/{id}", axum::routing::delete(delete_scratch))
}
