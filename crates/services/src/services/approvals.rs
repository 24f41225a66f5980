use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::{
    DBService,
    models::{
        execution_process::ExecutionProcess,
        task::{Task, TaskStatus},
    },
};
use executors::logs::{
    NormalizedEntry, NormalizedEntryType, ToolStatus,
    utils::ConversationPatch,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use utils::{log_msg::LogMsg, msg_store::MsgStore};
use uuid::Uuid;

pub const DEFAULT_APPROVAL_TIMEOUT_SECS: i64 = 900;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval not found")]
    NotFound,
    #[error("Approval already completed")]
    AlreadyCompleted,
    #[error("No matching tool_use entry awaiting approval")]
    NoToolUseEntry,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Terminal outcome of an approval request. A pending approval transitions
/// into exactly one of these, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Denied { reason: Option<String> },
    TimedOut,
}

impl ApprovalStatus {
    fn to_tool_status(&self) -> ToolStatus {
        match self {
            ApprovalStatus::Approved => ToolStatus::Approved,
            ApprovalStatus::Denied { reason } => ToolStatus::Denied {
                reason: reason.clone(),
            },
            ApprovalStatus::TimedOut => ToolStatus::TimedOut,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateApprovalRequest {
    pub execution_process_id: Uuid,
    pub tool_name: String,
    pub tool_call_id: String,
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub reason: Option<String>,
}

struct PendingApproval {
    entry_index: usize,
    entry: NormalizedEntry,
    execution_process_id: Uuid,
    #[allow(dead_code)]
    tool_name: String,
    msg_store: Arc<MsgStore>,
    responder: oneshot::Sender<ApprovalStatus>,
    /// Installed after the entry is registered; the watcher must never be
    /// able to fire before the entry it expires exists.
    timeout_handle: Option<tokio::task::JoinHandle<()>>,
}

/// In-memory approval workflow. Approvals are deliberately ephemeral: a
/// restart drops all pending entries, and executors re-request or time out
/// on their own.
#[derive(Clone)]
pub struct ApprovalBroker {
    db: DBService,
    pending: Arc<Mutex<HashMap<Uuid, PendingApproval>>>,
    completed: Arc<Mutex<HashMap<Uuid, ApprovalStatus>>>,
}

impl ApprovalBroker {
    pub fn new(db: DBService) -> Self {
        Self {
            db,
            pending: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an approval request for a tool call and suspend the caller
    /// until a response arrives or the timeout fires.
    ///
    /// The most recent `tool_use` entry with status `created` and a
    /// matching `tool_call_id` is transitioned to `pending_approval` in
    /// place; its absence means the stream is out of sync and the request
    /// is rejected.
    pub async fn request(
        &self,
        request: CreateApprovalRequest,
        msg_store: Arc<MsgStore>,
    ) -> Result<(Uuid, oneshot::Receiver<ApprovalStatus>), ApprovalError> {
        let (entry_index, entry) =
            Self::find_created_tool_use(&msg_store, &request.tool_call_id)
                .ok_or(ApprovalError::NoToolUseEntry)?;

        let approval_id = Uuid::new_v4();
        let requested_at = Utc::now();
        let timeout_at = requested_at
            + ChronoDuration::seconds(
                request
                    .timeout_seconds
                    .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS),
            );

        let pending_entry = entry
            .with_tool_status(ToolStatus::PendingApproval {
                approval_id: approval_id.to_string(),
                requested_at,
                timeout_at,
            })
            .ok_or(ApprovalError::NoToolUseEntry)?;
        msg_store.push_patch(ConversationPatch::replace(entry_index, pending_entry));

        let (responder, waiter) = oneshot::channel();

        self.pending.lock().await.insert(
            approval_id,
            PendingApproval {
                entry_index,
                entry,
                execution_process_id: request.execution_process_id,
                tool_name: request.tool_name,
                msg_store,
                responder,
                timeout_handle: None,
            },
        );

        let timeout_handle = {
            let broker = self.clone();
            let duration = (timeout_at - requested_at)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(0));
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                broker.expire(approval_id).await;
            })
        };
        if let Some(pending) = self.pending.lock().await.get_mut(&approval_id) {
            pending.timeout_handle = Some(timeout_handle);
        } else {
            // Resolved before the watcher was even installed
            timeout_handle.abort();
        }

        // Draw the user's attention to the waiting tool call.
        self.transition_task(request.execution_process_id, TaskStatus::InProgress, TaskStatus::InReview)
            .await;

        Ok((approval_id, waiter))
    }

    /// Resolve a pending approval. Responding to an approval that already
    /// completed is rejected so double-clicks and races stay harmless.
    pub async fn respond(
        &self,
        approval_id: Uuid,
        response: ApprovalResponse,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let status = if response.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied {
                reason: response.reason,
            }
        };
        self.finish(approval_id, status, true).await
    }

    /// Deny a pending approval on behalf of the system (e.g. the owning
    /// execution stopped).
    pub async fn cancel(&self, approval_id: Uuid) -> Result<ApprovalStatus, ApprovalError> {
        self.finish(
            approval_id,
            ApprovalStatus::Denied {
                reason: Some("Cancelled".to_string()),
            },
            false,
        )
        .await
    }

    /// Cancel every pending approval belonging to an execution process;
    /// called when the process is stopped.
    pub async fn cancel_for_process(&self, execution_process_id: Uuid) -> usize {
        let ids: Vec<Uuid> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, p)| p.execution_process_id == execution_process_id)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Process ids among `process_ids` that have at least one pending
    /// approval; used for UI badges.
    pub async fn pending_for(&self, process_ids: &[Uuid]) -> HashSet<Uuid> {
        let pending = self.pending.lock().await;
        pending
            .values()
            .filter(|p| process_ids.contains(&p.execution_process_id))
            .map(|p| p.execution_process_id)
            .collect()
    }

    pub async fn status(&self, approval_id: Uuid) -> Option<ApprovalStatus> {
        self.completed.lock().await.get(&approval_id).cloned()
    }

    async fn expire(&self, approval_id: Uuid) {
        match self.finish(approval_id, ApprovalStatus::TimedOut, false).await {
            Ok(_) => tracing::info!("Approval {approval_id} timed out"),
            // Raced with a respond; the winner already finished it
            Err(_) => {}
        }
    }

    async fn finish(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        resume_task: bool,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let pending = {
            let mut map = self.pending.lock().await;
            match map.remove(&approval_id) {
                Some(p) => p,
                None => {
                    return if self.completed.lock().await.contains_key(&approval_id) {
                        Err(ApprovalError::AlreadyCompleted)
                    } else {
                        Err(ApprovalError::NotFound)
                    };
                }
            }
        };

        if let Some(handle) = &pending.timeout_handle {
            handle.abort();
        }

        if let Some(resolved_entry) = pending.entry.with_tool_status(status.to_tool_status()) {
            pending
                .msg_store
                .push_patch(ConversationPatch::replace(pending.entry_index, resolved_entry));
        }

        // A dropped waiter just means the executor went away first.
        let _ = pending.responder.send(status.clone());

        self.completed
            .lock()
            .await
            .insert(approval_id, status.clone());

        if resume_task {
            self.transition_task(
                pending.execution_process_id,
                TaskStatus::InReview,
                TaskStatus::InProgress,
            )
            .await;
        }

        Ok(status)
    }

    /// Best-effort task status nudge tied to the approval lifecycle.
    async fn transition_task(&self, execution_process_id: Uuid, from: TaskStatus, to: TaskStatus) {
        let ctx = match ExecutionProcess::load_context(&self.db.pool, execution_process_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!(
                    "Skipping task transition for approval on {execution_process_id}: {e}"
                );
                return;
            }
        };
        if ctx.task.status == from
            && let Err(e) = Task::update_status(&self.db.pool, ctx.task.id, to).await
        {
            tracing::error!("Failed to update task status for approval: {e}");
        }
    }

    /// Latest state of each entry index, folded over the store's history,
    /// searched in reverse for the newest `created` tool call matching
    /// `tool_call_id`.
    fn find_created_tool_use(
        msg_store: &MsgStore,
        tool_call_id: &str,
    ) -> Option<(usize, NormalizedEntry)> {
        let mut latest: HashMap<usize, NormalizedEntry> = HashMap::new();
        for msg in msg_store.get_history() {
            if let LogMsg::JsonPatch(patch) = msg {
                for (index, entry) in ConversationPatch::extract_normalized_entries(&patch) {
                    latest.insert(index, entry);
                }
            }
        }

        let mut indices: Vec<usize> = latest.keys().copied().collect();
        indices.sort_unstable();
        for index in indices.into_iter().rev() {
            let entry = &latest[&index];
            if entry.tool_call_id() != Some(tool_call_id) {
                continue;
            }
            if let NormalizedEntryType::ToolUse { status, .. } = &entry.entry_type
                && *status == ToolStatus::Created
            {
                return Some((index, entry.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use executors::logs::ActionType;
    use tempfile::TempDir;

    use super::*;

    async fn test_broker() -> (ApprovalBroker, TempDir) {
        let td = TempDir::new().unwrap();
        let db = DBService::new(&td.path().join("test.db")).await.unwrap();
        (ApprovalBroker::new(db), td)
    }

    fn seed_tool_use(store: &MsgStore, index: usize, tool_call_id: &str) {
        let entry = NormalizedEntry {
            timestamp: None,
            entry_type: NormalizedEntryType::ToolUse {
                tool_name: "bash".to_string(),
                action_type: ActionType::CommandRun {
                    command: "rm -rf build".to_string(),
                },
                status: ToolStatus::Created,
            },
            content: "`rm -rf build`".to_string(),
            metadata: Some(serde_json::json!({ "tool_call_id": tool_call_id })),
        };
        store.push_patch(ConversationPatch::add_normalized_entry(index, entry));
    }

    fn latest_status(store: &MsgStore, index: usize) -> Option<ToolStatus> {
        let mut status = None;
        for msg in store.get_history() {
            if let LogMsg::JsonPatch(patch) = msg {
                for (i, entry) in ConversationPatch::extract_normalized_entries(&patch) {
                    if i == index
                        && let NormalizedEntryType::ToolUse { status: s, .. } = entry.entry_type
                    {
                        status = Some(s);
                    }
                }
            }
        }
        status
    }

    #[tokio::test]
    async fn respond_approves_and_patches_entry() {
        let (broker, _td) = test_broker().await;
        let store = Arc::new(MsgStore::new());
        seed_tool_use(&store, 0, "call_1");

        let (approval_id, waiter) = broker
            .request(
                CreateApprovalRequest {
                    execution_process_id: Uuid::new_v4(),
                    tool_name: "bash".to_string(),
                    tool_call_id: "call_1".to_string(),
                    timeout_seconds: Some(60),
                },
                store.clone(),
            )
            .await
            .unwrap();

        assert!(matches!(
            latest_status(&store, 0),
            Some(ToolStatus::PendingApproval { .. })
        ));

        let status = broker
            .respond(
                approval_id,
                ApprovalResponse {
                    approved: true,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        assert_eq!(waiter.await.unwrap(), ApprovalStatus::Approved);
        assert_eq!(latest_status(&store, 0), Some(ToolStatus::Approved));
    }

    #[tokio::test]
    async fn timeout_resolves_waiter_and_rejects_late_response() {
        let (broker, _td) = test_broker().await;
        let store = Arc::new(MsgStore::new());
        seed_tool_use(&store, 0, "call_2");

        let (approval_id, waiter) = broker
            .request(
                CreateApprovalRequest {
                    execution_process_id: Uuid::new_v4(),
                    tool_name: "bash".to_string(),
                    tool_call_id: "call_2".to_string(),
                    timeout_seconds: Some(0),
                },
                store.clone(),
            )
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap(), ApprovalStatus::TimedOut);
        assert_eq!(latest_status(&store, 0), Some(ToolStatus::TimedOut));

        let err = broker
            .respond(
                approval_id,
                ApprovalResponse {
                    approved: true,
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn request_without_matching_entry_is_rejected() {
        let (broker, _td) = test_broker().await;
        let store = Arc::new(MsgStore::new());

        let err = broker
            .request(
                CreateApprovalRequest {
                    execution_process_id: Uuid::new_v4(),
                    tool_name: "bash".to_string(),
                    tool_call_id: "missing".to_string(),
                    timeout_seconds: Some(60),
                },
                store,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NoToolUseEntry));
    }

    #[tokio::test]
    async fn cancel_for_process_denies_with_reason() {
        let (broker, _td) = test_broker().await;
        let store = Arc::new(MsgStore::new());
        seed_tool_use(&store, 0, "call_3");

        let process_id = Uuid::new_v4();
        let (_approval_id, waiter) = broker
            .request(
                CreateApprovalRequest {
                    execution_process_id: process_id,
                    tool_name: "bash".to_string(),
                    tool_call_id: "call_3".to_string(),
                    timeout_seconds: Some(60),
                },
                store.clone(),
            )
            .await
            .unwrap();

        assert_eq!(broker.cancel_for_process(process_id).await, 1);
        assert_eq!(
            waiter.await.unwrap(),
            ApprovalStatus::Denied {
                reason: Some("Cancelled".to_string())
            }
        );
        assert!(matches!(
            latest_status(&store, 0),
            Some(ToolStatus::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() {
        let (broker, _td) = test_broker().await;
        let err = broker
            .respond(
                Uuid::new_v4(),
                ApprovalResponse {
                    approved: false,
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound));
    }
}
