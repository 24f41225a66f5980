use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod plain_text_processor;
pub mod stderr_processor;
pub mod utils;

/// The protocol-level, executor-agnostic unit shown to clients. Entries are
/// addressed by a stable index inside their message store; once added, an
/// entry's type never changes, only the status embedded in a tool use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub timestamp: Option<String>,
    pub entry_type: NormalizedEntryType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEntryType {
    UserMessage,
    AssistantMessage,
    ToolUse {
        tool_name: String,
        action_type: ActionType,
        #[serde(default)]
        status: ToolStatus,
    },
    SystemMessage,
    ErrorMessage,
    Thinking,
}

/// Approval-gated lifecycle of a tool call, transitioned in place via
/// replace patches on the entry's index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Created,
    PendingApproval {
        approval_id: String,
        requested_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    },
    Approved,
    Denied {
        reason: Option<String>,
    },
    TimedOut,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolStatus::Approved | ToolStatus::Denied { .. } | ToolStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Types of tool actions that can be performed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionType {
    FileRead {
        path: String,
    },
    FileEdit {
        path: String,
        #[serde(default)]
        unified_diff: Option<String>,
    },
    CommandRun {
        command: String,
    },
    Search {
        query: String,
    },
    WebFetch {
        url: String,
    },
    TodoManagement {
        todos: Vec<TodoItem>,
        operation: String,
    },
    Other {
        description: String,
    },
}

impl NormalizedEntry {
    /// `tool_call_id` carried in the entry metadata, for tool-use entries
    /// emitted by executors that support approvals.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("tool_call_id"))
            .and_then(|v| v.as_str())
    }

    /// Executor-native message id, when the executor exposes one.
    pub fn agent_message_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("message_id"))
            .and_then(|v| v.as_str())
    }

    pub fn with_tool_status(&self, status: ToolStatus) -> Option<NormalizedEntry> {
        match &self.entry_type {
            NormalizedEntryType::ToolUse {
                tool_name,
                action_type,
                ..
            } => Some(NormalizedEntry {
                timestamp: self.timestamp.clone(),
                entry_type: NormalizedEntryType::ToolUse {
                    tool_name: tool_name.clone(),
                    action_type: action_type.clone(),
                    status,
                },
                content: self.content.clone(),
                metadata: self.metadata.clone(),
            }),
            _ => None,
        }
    }
}

/// Timestamps on normalized entries are optional and ISO-8601 when present.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}
