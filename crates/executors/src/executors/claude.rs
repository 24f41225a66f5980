use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use utils::{
    log_msg::LogMsg, msg_store::MsgStore, path::make_path_relative, shell::get_shell_command,
};

use crate::{
    command::CommandBuilder,
    executors::{CodingAgentExecutor, ExecutorError, SlashCommand},
    logs::{
        ActionType, NormalizedEntry, NormalizedEntryType, TodoItem, ToolStatus,
        stderr_processor::normalize_stderr_logs,
        utils::{ConversationPatch, EntryIndexProvider},
    },
};

/// Executor driving the Claude CLI in stream-json mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaudeCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dangerously_skip_permissions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_command_override: Option<String>,
}

impl ClaudeCode {
    fn build_command_builder(&self) -> CommandBuilder {
        let base = self
            .base_command_override
            .clone()
            .unwrap_or_else(|| "npx -y @anthropic-ai/claude-code@latest".to_string());

        let mut params: Vec<&'static str> = vec!["-p"];
        if self.dangerously_skip_permissions.unwrap_or(false) {
            params.push("--dangerously-skip-permissions");
        }
        params.extend_from_slice(&["--verbose", "--output-format=stream-json"]);

        CommandBuilder::new(base).params(params)
    }

    fn combined_prompt(&self, prompt: &str) -> String {
        match &self.append_prompt {
            Some(append) => format!("{prompt}{append}"),
            None => prompt.to_string(),
        }
    }

    async fn spawn_command(
        &self,
        current_dir: &Path,
        command_line: &str,
        prompt: &str,
    ) -> Result<AsyncGroupChild, ExecutorError> {
        let (shell_cmd, shell_arg) = get_shell_command();

        let mut command = Command::new(shell_cmd);
        command
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(current_dir)
            .arg(shell_arg)
            .arg(command_line);

        let mut child = command.group_spawn()?;

        // Feed the prompt in, then close the pipe so the CLI sees EOF
        if let Some(mut stdin) = child.inner().stdin.take() {
            stdin
                .write_all(self.combined_prompt(prompt).as_bytes())
                .await?;
            stdin.shutdown().await?;
        }

        Ok(child)
    }
}

#[async_trait]
impl CodingAgentExecutor for ClaudeCode {
    async fn spawn(
        &self,
        current_dir: &Path,
        prompt: &str,
    ) -> Result<AsyncGroupChild, ExecutorError> {
        let command_line = self.build_command_builder().build_initial();
        self.spawn_command(current_dir, &command_line, prompt).await
    }

    async fn spawn_follow_up(
        &self,
        current_dir: &Path,
        prompt: &str,
        session_id: &str,
        _resume_message_id: Option<&str>,
    ) -> Result<AsyncGroupChild, ExecutorError> {
        // The CLI resumes whole sessions; message-granular resume is handled
        // upstream by dropping later turns from the history view.
        let command_line = self
            .build_command_builder()
            .build_follow_up(&["--resume".to_string(), session_id.to_string()]);
        self.spawn_command(current_dir, &command_line, prompt).await
    }

    fn normalize_logs(&self, msg_store: Arc<MsgStore>, worktree_path: &Path) {
        let entry_index_provider = EntryIndexProvider::start_from(&msg_store);

        ClaudeLogProcessor::process_logs(
            msg_store.clone(),
            worktree_path,
            entry_index_provider.clone(),
        );
        normalize_stderr_logs(msg_store, entry_index_provider);
    }

    fn slash_commands(&self) -> Vec<SlashCommand> {
        vec![
            SlashCommand {
                name: "/compact".to_string(),
                description: "Compact the conversation context".to_string(),
            },
            SlashCommand {
                name: "/review".to_string(),
                description: "Review the current changes".to_string(),
            },
        ]
    }
}

/// Streaming parser for Claude's stream-json output.
struct ClaudeLogProcessor {
    model_reported: bool,
}

impl ClaudeLogProcessor {
    fn new() -> Self {
        Self {
            model_reported: false,
        }
    }

    /// Consume stdout chunks from the store, parse complete JSON lines, and
    /// push add patches for the normalized entries they carry.
    fn process_logs(
        msg_store: Arc<MsgStore>,
        worktree_path: &Path,
        entry_index_provider: EntryIndexProvider,
    ) {
        let worktree_path = worktree_path.to_string_lossy().to_string();
        tokio::spawn(async move {
            let mut stream = msg_store.history_plus_stream();
            let mut buffer = String::new();
            let mut session_id_extracted = false;
            let mut processor = Self::new();

            while let Some(Ok(msg)) = stream.next().await {
                let chunk = match msg {
                    LogMsg::Stdout(x) => x,
                    LogMsg::Finished => break,
                    _ => continue,
                };

                buffer.push_str(&chunk);

                for line in buffer
                    .split_inclusive('\n')
                    .filter(|l| l.ends_with('\n'))
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
                {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ClaudeJson>(trimmed) {
                        Ok(claude_json) => {
                            if !session_id_extracted
                                && let Some(session_id) = claude_json.session_id()
                            {
                                msg_store.push_session_id(session_id.to_string());
                                session_id_extracted = true;
                            }

                            for entry in
                                processor.to_normalized_entries(&claude_json, &worktree_path)
                            {
                                let index = entry_index_provider.next();
                                msg_store
                                    .push_patch(ConversationPatch::add_normalized_entry(index, entry));
                            }
                        }
                        Err(_) => {
                            // Non-JSON noise on stdout (npm banners and the
                            // like) surfaces as raw text
                            let entry = NormalizedEntry {
                                timestamp: None,
                                entry_type: NormalizedEntryType::SystemMessage,
                                content: trimmed.to_string(),
                                metadata: None,
                            };
                            let index = entry_index_provider.next();
                            msg_store
                                .push_patch(ConversationPatch::add_normalized_entry(index, entry));
                        }
                    }
                }

                // Keep the trailing partial line for the next chunk
                buffer = buffer
                    .rsplit('\n')
                    .next()
                    .map(str::to_owned)
                    .unwrap_or_default();
            }
        });
    }

    fn to_normalized_entries(
        &mut self,
        json: &ClaudeJson,
        worktree_path: &str,
    ) -> Vec<NormalizedEntry> {
        match json {
            ClaudeJson::System { model, .. } => {
                if self.model_reported {
                    return Vec::new();
                }
                self.model_reported = true;
                let content = match model {
                    Some(model) => format!("System initialized with model: {model}"),
                    None => "System initialized".to_string(),
                };
                vec![NormalizedEntry {
                    timestamp: None,
                    entry_type: NormalizedEntryType::SystemMessage,
                    content,
                    metadata: None,
                }]
            }
            ClaudeJson::Assistant { message, .. } => {
                let mut entries = Vec::new();
                for item in &message.content {
                    match item {
                        ClaudeContentItem::Text { text } => entries.push(NormalizedEntry {
                            timestamp: None,
                            entry_type: NormalizedEntryType::AssistantMessage,
                            content: text.clone(),
                            metadata: message
                                .id
                                .as_ref()
                                .map(|id| serde_json::json!({ "message_id": id })),
                        }),
                        ClaudeContentItem::Thinking { thinking } => entries.push(NormalizedEntry {
                            timestamp: None,
                            entry_type: NormalizedEntryType::Thinking,
                            content: thinking.clone(),
                            metadata: None,
                        }),
                        ClaudeContentItem::ToolUse { id, name, input } => {
                            let action_type = Self::extract_action_type(name, input, worktree_path);
                            let content = Self::tool_content(name, &action_type, input);
                            entries.push(NormalizedEntry {
                                timestamp: None,
                                entry_type: NormalizedEntryType::ToolUse {
                                    tool_name: name.clone(),
                                    action_type,
                                    status: ToolStatus::Created,
                                },
                                content,
                                metadata: Some(serde_json::json!({ "tool_call_id": id })),
                            });
                        }
                        ClaudeContentItem::ToolResult { .. } => {}
                    }
                }
                entries
            }
            ClaudeJson::User { .. } => Vec::new(),
            ClaudeJson::Result { is_error, result } => {
                // Terminal result line; only surface failures, the assistant
                // message already covers success
                if is_error.unwrap_or(false) {
                    vec![NormalizedEntry {
                        timestamp: None,
                        entry_type: NormalizedEntryType::ErrorMessage,
                        content: result.clone().unwrap_or_else(|| "Agent failed".to_string()),
                        metadata: None,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn extract_action_type(
        tool_name: &str,
        input: &serde_json::Value,
        worktree_path: &str,
    ) -> ActionType {
        let str_field =
            |key: &str| -> Option<String> { input.get(key)?.as_str().map(str::to_string) };

        match tool_name.to_lowercase().as_str() {
            "read" | "notebookread" => match str_field("file_path") {
                Some(path) => ActionType::FileRead {
                    path: make_path_relative(&path, worktree_path),
                },
                None => ActionType::Other {
                    description: "File read".to_string(),
                },
            },
            "edit" | "write" | "multiedit" | "notebookedit" => match str_field("file_path") {
                Some(path) => ActionType::FileEdit {
                    path: make_path_relative(&path, worktree_path),
                    unified_diff: None,
                },
                None => ActionType::Other {
                    description: "File edit".to_string(),
                },
            },
            "bash" => ActionType::CommandRun {
                command: str_field("command").unwrap_or_default(),
            },
            "grep" | "glob" => ActionType::Search {
                query: str_field("pattern").unwrap_or_default(),
            },
            "webfetch" | "websearch" => ActionType::WebFetch {
                url: str_field("url").or_else(|| str_field("query")).unwrap_or_default(),
            },
            "todowrite" => {
                let todos = input
                    .get("todos")
                    .and_then(|t| serde_json::from_value::<Vec<TodoItem>>(t.clone()).ok())
                    .unwrap_or_default();
                ActionType::TodoManagement {
                    todos,
                    operation: "write".to_string(),
                }
            }
            _ => ActionType::Other {
                description: tool_name.to_string(),
            },
        }
    }

    fn tool_content(tool_name: &str, action_type: &ActionType, input: &serde_json::Value) -> String {
        match action_type {
            ActionType::FileRead { path } => format!("`{path}`"),
            ActionType::FileEdit { path, .. } => format!("`{path}`"),
            ActionType::CommandRun { command } => format!("`{command}`"),
            ActionType::Search { query } => format!("`{query}`"),
            ActionType::WebFetch { url } => url.clone(),
            ActionType::TodoManagement { .. } => "Update todo list".to_string(),
            ActionType::Other { .. } => input
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| tool_name.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeJson {
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: ClaudeMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        result: Option<String>,
    },
}

impl ClaudeJson {
    fn session_id(&self) -> Option<&str> {
        match self {
            ClaudeJson::System { session_id, .. }
            | ClaudeJson::Assistant { session_id, .. }
            | ClaudeJson::User { session_id } => session_id.as_deref(),
            ClaudeJson::Result { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<ClaudeContentItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeContentItem {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {},
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(lines: &[&str]) -> Vec<NormalizedEntry> {
        let mut processor = ClaudeLogProcessor::new();
        lines
            .iter()
            .filter_map(|l| serde_json::from_str::<ClaudeJson>(l).ok())
            .flat_map(|json| processor.to_normalized_entries(&json, "/work"))
            .collect()
    }

    #[test]
    fn assistant_text_becomes_assistant_entry() {
        let entries = normalize(&[
            r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"text","text":"done"}]},"session_id":"s1"}"#,
        ]);
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].entry_type,
            NormalizedEntryType::AssistantMessage
        ));
        assert_eq!(entries[0].agent_message_id(), Some("msg_1"));
    }

    #[test]
    fn tool_use_carries_call_id_and_created_status() {
        let entries = normalize(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"call_9","name":"Bash","input":{"command":"cargo check"}}]}}"#,
        ]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_call_id(), Some("call_9"));
        match &entries[0].entry_type {
            NormalizedEntryType::ToolUse {
                tool_name,
                action_type,
                status,
            } => {
                assert_eq!(tool_name, "Bash");
                assert_eq!(*status, ToolStatus::Created);
                assert!(matches!(action_type, ActionType::CommandRun { command } if command == "cargo check"));
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn file_paths_are_relativized() {
        let entries = normalize(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"c1","name":"Read","input":{"file_path":"/work/src/main.rs"}}]}}"#,
        ]);
        match &entries[0].entry_type {
            NormalizedEntryType::ToolUse { action_type, .. } => {
                assert!(matches!(action_type, ActionType::FileRead { path } if path == "src/main.rs"));
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn model_reported_once() {
        let entries = normalize(&[
            r#"{"type":"system","session_id":"s1","model":"claude-x"}"#,
            r#"{"type":"system","session_id":"s1","model":"claude-x"}"#,
        ]);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn error_result_surfaces() {
        let entries = normalize(&[r#"{"type":"result","is_error":true,"result":"boom"}"#]);
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].entry_type,
            NormalizedEntryType::ErrorMessage
        ));
    }
}
