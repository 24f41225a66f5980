use std::path::Path;

use async_trait::async_trait;
use command_group::AsyncGroupChild;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::{
    actions::{
        coding_agent_follow_up::CodingAgentFollowUpRequest,
        coding_agent_initial::CodingAgentInitialRequest, review::ReviewRequest,
        script::ScriptRequest,
    },
    executors::ExecutorError,
};
pub mod coding_agent_follow_up;
pub mod coding_agent_initial;
pub mod review;
pub mod script;

#[enum_dispatch]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ExecutorActionType {
    ScriptRequest,
    CodingAgentInitialRequest,
    CodingAgentFollowUpRequest,
    ReviewRequest,
}

/// One step of a workspace's serial execution chain. `next_action` links to
/// the step that follows once this one exits cleanly; the engine walks the
/// chain lazily so steps can be appended while earlier ones run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorAction {
    pub typ: ExecutorActionType,
    pub next_action: Option<Box<ExecutorAction>>,
}

impl ExecutorAction {
    pub fn new(typ: ExecutorActionType, next_action: Option<Box<ExecutorAction>>) -> Self {
        Self { typ, next_action }
    }

    pub fn typ(&self) -> &ExecutorActionType {
        &self.typ
    }

    pub fn next_action(&self) -> Option<&ExecutorAction> {
        self.next_action.as_deref()
    }
}

#[async_trait]
#[enum_dispatch(ExecutorActionType)]
pub trait Executable {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError>;
}

#[async_trait]
impl Executable for ExecutorAction {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError> {
        self.typ.spawn(current_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::script::{ScriptContext, ScriptRequest, ScriptRequestLanguage};

    fn script_action(script: &str, next: Option<Box<ExecutorAction>>) -> ExecutorAction {
        ExecutorAction::new(
            ExecutorActionType::ScriptRequest(ScriptRequest {
                script: script.to_string(),
                language: ScriptRequestLanguage::Bash,
                context: ScriptContext::SetupScript,
                working_dir: None,
            }),
            next,
        )
    }

    #[test]
    fn chain_round_trips_through_json() {
        let chain = script_action("echo one", Some(Box::new(script_action("echo two", None))));

        let json = serde_json::to_string(&chain).unwrap();
        let parsed: ExecutorAction = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, chain);
        assert!(parsed.next_action().is_some());
        assert!(parsed.next_action().unwrap().next_action().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = r#"{"typ":{"type":"ReviewRobot","script":"x"},"next_action":null}"#;
        assert!(serde_json::from_str::<ExecutorAction>(raw).is_err());
    }
}
