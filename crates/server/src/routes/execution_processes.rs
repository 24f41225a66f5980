use axum::{
    BoxError, Extension, Router,
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    response::{
        Json as ResponseJson, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use db::models::{
    execution_process::ExecutionProcess,
    execution_process_repo_state::ExecutionProcessRepoState,
};
use deployment::Deployment;
use futures_util::TryStreamExt;
use serde::Deserialize;
use services::services::container::ContainerService;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError, middleware::load_execution_process_middleware};

#[derive(Debug, Deserialize)]
pub struct ExecutionProcessQuery {
    pub session_id: Uuid,
    /// Include rows soft-deleted by restore; the Processes tab sets this.
    #[serde(default)]
    pub show_dropped: bool,
}

pub async fn get_execution_processes(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<ExecutionProcessQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ExecutionProcess>>>, ApiError> {
    let processes = ExecutionProcess::find_by_session_id(
        &deployment.db().pool,
        query.session_id,
        query.show_dropped,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(processes)))
}

pub async fn get_execution_process_by_id(
    Extension(execution_process): Extension<ExecutionProcess>,
) -> Result<ResponseJson<ApiResponse<ExecutionProcess>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(execution_process)))
}

pub async fn stop_execution_process(
    Extension(execution_process): Extension<ExecutionProcess>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment
        .container()
        .stop_execution(&execution_process)
        .await?;
    // A stopped process can no longer act on an approval decision
    deployment
        .approvals()
        .cancel_for_process(execution_process.id)
        .await;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn get_repo_states(
    Extension(execution_process): Extension<ExecutionProcess>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<ExecutionProcessRepoState>>>, ApiError> {
    let states = ExecutionProcessRepoState::find_by_execution_process_id(
        &deployment.db().pool,
        execution_process.id,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(states)))
}

pub async fn stream_raw_logs(
    State(deployment): State<DeploymentImpl>,
    Path(exec_id): Path<Uuid>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, axum::http::StatusCode>
{
    let stream = deployment
        .container()
        .stream_raw_logs(&exec_id)
        .await
        .ok_or(axum::http::StatusCode::NOT_FOUND)?;

    Ok(Sse::new(stream.map_err(|e| -> BoxError { e.into() })).keep_alive(KeepAlive::default()))
}

pub async fn stream_normalized_logs(
    State(deployment): State<DeploymentImpl>,
    Path(exec_id): Path<Uuid>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, axum::http::StatusCode>
{
    let stream = deployment
        .container()
        .stream_normalized_logs(&exec_id)
        .await
        .ok_or(axum::http::StatusCode::NOT_FOUND)?;

    Ok(Sse::new(stream.map_err(|e| -> BoxError { e.into() })).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct SessionStreamQuery {
    pub session_id: Uuid,
}

pub async fn stream_session_processes(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<SessionStreamQuery>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, ApiError> {
    let stream = deployment
        .events()
        .stream_processes_for_session(query.session_id)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to open process stream: {e}")))?;
    Ok(Sse::new(stream.map_err(|e| -> BoxError { e.into() })).keep_alive(KeepAlive::default()))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let process_id_router = Router::new()
        .route("/", get(get_execution_process_by_id))
        .route("/stop", post(stop_execution_process))
        .route("/repo-states", get(get_repo_states))
        .route("/raw-logs", get(stream_raw_logs))
        .route("/normalized-logs", get(stream_normalized_logs))
        .layer(from_fn_with_state(
            deployment.clone(),
            load_execution_process_middleware,
        ));

    Router::new()
        .route("/execution-processes", get(get_execution_processes))
        .route("/execution-processes/stream", get(stream_session_processes))
        .nest("/execution-processes/{id}", process_id_router)
}
