use std::path::Path;

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use utils::shell::get_shell_command;

use crate::{actions::Executable, executors::ExecutorError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ScriptRequestLanguage {
    Bash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ScriptContext {
    SetupScript,
    CleanupScript,
    ArchiveScript,
    DevServer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptRequest {
    pub script: String,
    pub language: ScriptRequestLanguage,
    pub context: ScriptContext,
    /// Subdirectory of the workspace container to run in, typically the
    /// repo's worktree name. Runs in the container root when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[async_trait]
impl Executable for ScriptRequest {
    async fn spawn(&self, current_dir: &Path) -> Result<AsyncGroupChild, ExecutorError> {
        let (shell_cmd, shell_arg) = get_shell_command();
        let dir = match &self.working_dir {
            Some(sub) => current_dir.join(sub),
            None => current_dir.to_path_buf(),
        };

        let mut command = Command::new(shell_cmd);
        command
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .arg(shell_arg)
            .arg(&self.script)
            .current_dir(dir);

        let child = command.group_spawn()?;

        Ok(child)
    }
}
