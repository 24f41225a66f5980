use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
};
use db::models::{execution_process::ExecutionProcess, workspace::Workspace};
use deployment::Deployment;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

/// Resolve `:id` to a `Workspace` row and stash it as an extension so
/// handlers receive the loaded model instead of a raw id.
pub async fn load_workspace_middleware(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let workspace = Workspace::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Workspace {id} not found")))?;

    request.extensions_mut().insert(workspace);
    Ok(next.run(request).await)
}

pub async fn load_execution_process_middleware(
    State(deployment): State<DeploymentImpl>,
    Path(id): Path<Uuid>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let execution_process = ExecutionProcess::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution process {id} not found")))?;

    request.extensions_mut().insert(execution_process);
    Ok(next.run(request).await)
}
