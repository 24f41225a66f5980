use std::path::Path;

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use serde::{Deserialize, Serialize};

use crate::{
    actions::Executable,
    executors::{CodingAgent, CodingAgentExecutor, ExecutorError},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodingAgentInitialRequest {
    pub prompt: String,
    pub executor: CodingAgent,
}

#[async_trait]
impl Executable for CodingAgentInitialRequest {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError> {
        self.executor.spawn(current_dir, &self.prompt).await
    }
}
