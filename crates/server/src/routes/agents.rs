use axum::{Router, response::Json as ResponseJson, routing::get};
use executors::executors::{CodingAgent, CodingAgentExecutor, SlashCommand};
use serde::Serialize;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

#[derive(Debug, Serialize)]
pub struct AgentInfo {
    pub kind: String,
    pub slash_commands: Vec<SlashCommand>,
}

/// The coding agents this build can drive, with their UX affordances.
pub async fn get_agents() -> ResponseJson<ApiResponse<Vec<AgentInfo>>> {
    let agents = [CodingAgent::default(), CodingAgent::Echo(Default::default())]
        .into_iter()
        .map(|agent| AgentInfo {
            kind: agent.to_string(),
            slash_commands: agent.slash_commands(),
        })
        .collect();
    ResponseJson(ApiResponse::success(agents))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/agents", get(get_agents))
}
