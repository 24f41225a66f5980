use axum::{
    Router,
    routing::{IntoMakeService, get},
};

use crate::DeploymentImpl;

pub mod agents;
pub mod approvals;
pub mod events;
pub mod execution_processes;
pub mod health;
pub mod projects;
pub mod repos;
pub mod scratch;
pub mod tags;
pub mod tasks;
pub mod workspaces;

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(projects::router())
        .merge(repos::router())
        .merge(tasks::router())
        .merge(workspaces::router(&deployment))
        .merge(execution_processes::router(&deployment))
        .merge(approvals::router())
        .merge(agents::router())
        .merge(tags::router())
        .merge(scratch::router())
        .merge(events::router())
        .with_state(deployment);

    Router::new().nest("/api", base_routes).into_make_service()
}
