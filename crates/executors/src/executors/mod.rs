use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumDiscriminants, EnumString, VariantNames};
use thiserror::Error;
use utils::msg_store::MsgStore;

use crate::executors::{claude::ClaudeCode, echo::Echo};

pub mod claude;
pub mod echo;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Follow-up is not supported: {0}")]
    FollowUpNotSupported(String),
    #[error("Unknown executor type: {0}")]
    UnknownExecutorType(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// UX affordance: commands an executor understands inside a prompt. Not
/// used in orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashCommand {
    pub name: String,
    pub description: String,
}

/// The set of coding agents the orchestrator can drive. Serialized into
/// stored `executor_action` JSON, so variants carry their own options.
#[enum_dispatch]
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Display, EnumDiscriminants, VariantNames,
)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[strum_discriminants(
    name(BaseCodingAgent),
    derive(EnumString, Hash, strum_macros::Display, Serialize, Deserialize),
    strum(serialize_all = "SCREAMING_SNAKE_CASE"),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum CodingAgent {
    ClaudeCode,
    Echo,
}

impl Default for CodingAgent {
    fn default() -> Self {
        CodingAgent::ClaudeCode(ClaudeCode::default())
    }
}

/// Contract every coding agent must satisfy for the execution engine:
/// spawn (initial and resumed), a streaming normalizer of its own output
/// format, and the optional UX surface.
#[async_trait]
#[enum_dispatch(CodingAgent)]
pub trait CodingAgentExecutor {
    async fn spawn(
        &self,
        current_dir: &Path,
        prompt: &str,
    ) -> Result<AsyncGroupChild, ExecutorError>;

    async fn spawn_follow_up(
        &self,
        current_dir: &Path,
        prompt: &str,
        session_id: &str,
        resume_message_id: Option<&str>,
    ) -> Result<AsyncGroupChild, ExecutorError>;

    /// Attach the executor's streaming parser to a message store. Pure with
    /// respect to the raw chunks: the same input stream always yields the
    /// same entries.
    fn normalize_logs(&self, msg_store: Arc<MsgStore>, worktree_path: &Path);

    fn slash_commands(&self) -> Vec<SlashCommand> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_as_string() {
        let kind: BaseCodingAgent = "CLAUDE_CODE".parse().unwrap();
        assert_eq!(kind.to_string(), "CLAUDE_CODE");
    }

    #[test]
    fn agent_serializes_with_kind_tag() {
        let agent = CodingAgent::default();
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["kind"], "CLAUDE_CODE");
    }
}
