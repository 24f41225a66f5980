use std::path::Path;

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use serde::{Deserialize, Serialize};

use crate::{
    actions::Executable,
    executors::{CodingAgent, CodingAgentExecutor, ExecutorError},
};

/// Drive the agent over review feedback (e.g. PR comments) gathered for
/// the workspace. Resumes the existing session when one is known so the
/// review lands in the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRequest {
    pub prompt: String,
    pub executor: CodingAgent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[async_trait]
impl Executable for ReviewRequest {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError> {
        match &self.session_id {
            Some(session_id) => {
                self.executor
                    .spawn_follow_up(current_dir, &self.prompt, session_id, None)
                    .await
            }
            None => self.executor.spawn(current_dir, &self.prompt).await,
        }
    }
}
