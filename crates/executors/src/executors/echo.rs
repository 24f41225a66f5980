use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use utils::{msg_store::MsgStore, shell::get_shell_command};

use crate::{
    executors::{CodingAgentExecutor, ExecutorError},
    logs::{
        NormalizedEntry, NormalizedEntryType,
        plain_text_processor::PlainTextLogProcessor,
        stderr_processor::normalize_stderr_logs,
        utils::EntryIndexProvider,
    },
};

/// Trivial executor that replays its prompt on stdout. Exists to exercise
/// the full execution pipeline without a real agent binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Echo {
    /// Seconds to sleep before echoing, to make runs observable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
}

#[async_trait]
impl CodingAgentExecutor for Echo {
    async fn spawn(
        &self,
        current_dir: &Path,
        prompt: &str,
    ) -> Result<AsyncGroupChild, ExecutorError> {
        let (shell_cmd, shell_arg) = get_shell_command();
        let delay = self.delay_secs.unwrap_or(0);
        let script = format!("sleep {delay}; cat");

        let mut command = Command::new(shell_cmd);
        command
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(current_dir)
            .arg(shell_arg)
            .arg(script);

        let mut child = command.group_spawn()?;

        if let Some(mut stdin) = child.inner().stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        Ok(child)
    }

    async fn spawn_follow_up(
        &self,
        current_dir: &Path,
        prompt: &str,
        _session_id: &str,
        _resume_message_id: Option<&str>,
    ) -> Result<AsyncGroupChild, ExecutorError> {
        self.spawn(current_dir, prompt).await
    }

    fn normalize_logs(&self, msg_store: Arc<MsgStore>, _worktree_path: &Path) {
        let entry_index_provider = EntryIndexProvider::start_from(&msg_store);

        // A fixed session id keeps the resume path working end to end.
        msg_store.push_session_id("echo-session".to_string());

        {
            let msg_store = msg_store.clone();
            let index_provider = entry_index_provider.clone();
            tokio::spawn(async move {
                let mut stdout = msg_store.stdout_chunked_stream();

                let mut processor = PlainTextLogProcessor::builder()
                    .normalized_entry_producer(|content: String| NormalizedEntry {
                        timestamp: None,
                        entry_type: NormalizedEntryType::AssistantMessage,
                        content,
                        metadata: None,
                    })
                    .index_provider(index_provider)
                    .build();

                while let Some(Ok(chunk)) = stdout.next().await {
                    for patch in processor.process(chunk) {
                        msg_store.push_patch(patch);
                    }
                }
            });
        }

        normalize_stderr_logs(msg_store, entry_index_provider);
    }
}
