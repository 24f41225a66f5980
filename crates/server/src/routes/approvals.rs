use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use services::services::{
    approvals::{ApprovalResponse, ApprovalStatus, CreateApprovalRequest},
    container::ContainerService,
};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Serialize)]
pub struct ApprovalResult {
    pub approval_id: Uuid,
    pub status: ApprovalStatus,
}

/// Called by the executor side when a tool call needs approval. Long-polls:
/// the response is the final status, after a user responded or the timeout
/// fired.
pub async fn request_approval(
    State(deployment): State<DeploymentImpl>,
    axum::Json(mut payload): axum::Json<CreateApprovalRequest>,
) -> Result<ResponseJson<ApiResponse<ApprovalResult>>, ApiError> {
    if payload.timeout_seconds.is_none() {
        payload.timeout_seconds =
            Some(deployment.config().read().await.approval_timeout_seconds);
    }

    let msg_store = deployment
        .container()
        .get_msg_store_by_id(&payload.execution_process_id)
        .await
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No live execution process {}",
                payload.execution_process_id
            ))
        })?;

    let (approval_id, waiter) = deployment.approvals().request(payload, msg_store).await?;

    // Suspend until resolution; the timeout watcher guarantees an answer.
    let status = waiter
        .await
        .map_err(|_| ApiError::BadRequest("Approval waiter dropped".to_string()))?;

    Ok(ResponseJson(ApiResponse::success(ApprovalResult {
        approval_id,
        status,
    })))
}

pub async fn respond_to_approval(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<ApprovalResponse>,
) -> Result<ResponseJson<ApiResponse<ApprovalStatus>>, ApiError> {
    let status = deployment.approvals().respond(id, payload).await?;
    Ok(ResponseJson(ApiResponse::success(status)))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    /// Comma-separated execution process ids.
    pub process_ids: String,
}

pub async fn pending_approvals(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<PendingQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Uuid>>>, ApiError> {
    let ids: Vec<Uuid> = query
        .process_ids
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let pending = deployment.approvals().pending_for(&ids).await;
    Ok(ResponseJson(ApiResponse::success(
        pending.into_iter().collect(),
    )))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/approvals/request", post(request_approval))
        .route("/approvals/pending", get(pending_approvals))
        .route("/approvals/{id}/respond", post(respond_to_approval))
}
