use std::path::Path;

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use serde::{Deserialize, Serialize};

use crate::{
    actions::Executable,
    executors::{CodingAgent, CodingAgentExecutor, ExecutorError},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodingAgentFollowUpRequest {
    pub prompt: String,
    pub executor: CodingAgent,
    /// The executor's own session id for the thread being resumed.
    pub session_id: String,
    /// Resume point within the session; the last message of the newest
    /// non-dropped turn after a restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_message_id: Option<String>,
}

#[async_trait]
impl Executable for CodingAgentFollowUpRequest {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError> {
        self.executor
            .spawn_follow_up(
                current_dir,
                &self.prompt,
                &self.session_id,
                self.resume_message_id.as_deref(),
            )
            .await
    }
}
