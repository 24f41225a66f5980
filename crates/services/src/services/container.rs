use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Error as AnyhowError, anyhow};
use async_trait::async_trait;
use axum::response::sse::Event;
use db::{
    DBService,
    models::{
        coding_agent_turn::CodingAgentTurn,
        execution_process::{
            CreateExecutionProcess, ExecutionContext, ExecutionProcess, ExecutionProcessRunReason,
        },
        execution_process_logs::ExecutionProcessLogs,
        execution_process_repo_state::ExecutionProcessRepoState,
        queued_message::QueuedMessage,
        repo::Repo,
        session::Session,
        task::{Task, TaskStatus},
        workspace::Workspace,
        workspace_repo::WorkspaceRepo,
    },
};
use executors::{
    actions::{
        ExecutorAction, ExecutorActionType,
        coding_agent_follow_up::CodingAgentFollowUpRequest,
        coding_agent_initial::CodingAgentInitialRequest,
        review::ReviewRequest,
        script::{ScriptContext, ScriptRequest, ScriptRequestLanguage},
    },
    executors::{CodingAgent, CodingAgentExecutor, ExecutorError},
    logs::{NormalizedEntry, NormalizedEntryType, utils::ConversationPatch},
};
use futures::{StreamExt, TryStreamExt, future};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle};
use utils::{log_msg::LogMsg, msg_store::MsgStore};
use uuid::Uuid;

use crate::services::{
    git::{GitService, GitServiceError},
    workspace_manager::WorkspaceError,
    worktree_manager::WorktreeError,
};

pub type ContainerRef = String;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    GitServiceError(#[from] GitServiceError),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    ExecutorError(#[from] ExecutorError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to kill process: {0}")]
    KillFailed(std::io::Error),
    #[error("Another action is already running for this workspace")]
    ChainBusy,
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

/// The execution engine's persistent half: chain construction, process
/// bookkeeping and the streaming facade. Live child handling is left to
/// the deployment-specific implementor.
#[async_trait]
pub trait ContainerService {
    fn msg_stores(&self) -> &Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>>;

    /// Per-workspace chain-head locks: exactly one action at a time may be
    /// persisted and spawned for a workspace, so sequencing decisions stay
    /// atomic with their row updates.
    fn chain_locks(&self) -> &Arc<tokio::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>;

    async fn chain_lock_for(&self, workspace_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.chain_locks().lock().await;
        locks
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn db(&self) -> &DBService;

    fn git(&self) -> &GitService;

    fn auto_commit_enabled(&self) -> bool;

    /// Absolute container directory of a materialized workspace.
    fn workspace_to_container_dir(&self, workspace: &Workspace) -> PathBuf;

    /// Materialize the workspace on disk (worktree per repo) and persist
    /// `container_ref`/`branch`.
    async fn create(&self, workspace: &Workspace) -> Result<ContainerRef, ContainerError>;

    async fn delete_inner(&self, workspace: &Workspace) -> Result<(), ContainerError>;

    async fn ensure_container_exists(
        &self,
        workspace: &Workspace,
    ) -> Result<ContainerRef, ContainerError>;

    async fn is_container_clean(&self, workspace: &Workspace) -> Result<bool, ContainerError>;

    async fn start_execution_inner(
        &self,
        workspace: &Workspace,
        execution_process: &ExecutionProcess,
        executor_action: &ExecutorAction,
    ) -> Result<(), ContainerError>;

    async fn stop_execution(
        &self,
        execution_process: &ExecutionProcess,
    ) -> Result<(), ContainerError>;

    async fn try_commit_changes(&self, ctx: &ExecutionContext) -> Result<bool, ContainerError>;

    async fn get_diff(
        &self,
        workspace: &Workspace,
    ) -> Result<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>, ContainerError>;

    async fn delete(&self, workspace: &Workspace) -> Result<(), ContainerError> {
        self.try_stop(workspace).await;
        self.delete_inner(workspace).await
    }

    /// Stop every running execution process of the workspace.
    async fn try_stop(&self, workspace: &Workspace) {
        if let Ok(processes) =
            ExecutionProcess::find_running_by_workspace_id(&self.db().pool, workspace.id).await
        {
            for process in processes {
                self.stop_execution(&process).await.unwrap_or_else(|e| {
                    tracing::debug!(
                        "Failed to stop execution process {} for workspace {}: {}",
                        process.id,
                        workspace.id,
                        e
                    );
                });
            }
        }
    }

    async fn get_msg_store_by_id(&self, uuid: &Uuid) -> Option<Arc<MsgStore>> {
        let map = self.msg_stores().read().await;
        map.get(uuid).cloned()
    }

    /// Build and start the full chain for a workspace: per-repo setup,
    /// the initial coding-agent action, then per-repo cleanup.
    async fn start_workspace(
        &self,
        workspace: &Workspace,
        prompt: String,
        executor: CodingAgent,
    ) -> Result<ExecutionProcess, ContainerError> {
        self.ensure_container_exists(workspace).await?;

        let repos = WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await?;

        let initial_action = ExecutorAction::new(
            ExecutorActionType::CodingAgentInitialRequest(CodingAgentInitialRequest {
                prompt,
                executor,
            }),
            Self::cleanup_chain(&repos),
        );

        let (action, run_reason) = match Self::setup_chain(&repos, initial_action.clone()) {
            Some(setup) => (setup, ExecutionProcessRunReason::SetupScript),
            None => (initial_action, ExecutionProcessRunReason::CodingAgent),
        };

        let session = Session::find_or_create(&self.db().pool, workspace.id).await?;
        self.start_execution(workspace, &session, &action, &run_reason)
            .await
    }

    /// One setup `ScriptRequest` per repo with a script, chained in repo
    /// order ahead of `tail`. When every participating repo opts into
    /// parallel setup the scripts are folded into a single composite
    /// process so the chain stays strictly serial.
    fn setup_chain(repos: &[(WorkspaceRepo, Repo)], tail: ExecutorAction) -> Option<ExecutorAction> {
        let scripted: Vec<&(WorkspaceRepo, Repo)> = repos
            .iter()
            .filter(|(_, repo)| {
                repo.setup_script
                    .as_deref()
                    .is_some_and(|s| !s.trim().is_empty())
            })
            .collect();

        if scripted.is_empty() {
            return None;
        }

        let all_parallel = scripted.len() > 1
            && scripted.iter().all(|(_, repo)| repo.parallel_setup_script);

        if all_parallel {
            let mut script = String::new();
            for (_, repo) in &scripted {
                let setup = repo.setup_script.as_deref().unwrap_or_default();
                script.push_str(&format!("( cd '{}' && {{ {setup}\n}} ) &\n", repo.name));
            }
            script.push_str("wait\n");

            return Some(ExecutorAction::new(
                ExecutorActionType::ScriptRequest(ScriptRequest {
                    script,
                    language: ScriptRequestLanguage::Bash,
                    context: ScriptContext::SetupScript,
                    working_dir: None,
                }),
                Some(Box::new(tail)),
            ));
        }

        let mut action = tail;
        for (_, repo) in scripted.into_iter().rev() {
            action = ExecutorAction::new(
                ExecutorActionType::ScriptRequest(ScriptRequest {
                    script: repo.setup_script.clone().unwrap_or_default(),
                    language: ScriptRequestLanguage::Bash,
                    context: ScriptContext::SetupScript,
                    working_dir: Some(repo.name.clone()),
                }),
                Some(Box::new(action)),
            );
        }
        Some(action)
    }

    /// Cleanup scripts chained in repo order, as the tail of an agent run.
    fn cleanup_chain(repos: &[(WorkspaceRepo, Repo)]) -> Option<Box<ExecutorAction>> {
        let mut tail: Option<Box<ExecutorAction>> = None;
        for (_, repo) in repos.iter().rev() {
            let Some(script) = repo
                .cleanup_script
                .as_ref()
                .filter(|s| !s.trim().is_empty())
            else {
                continue;
            };
            tail = Some(Box::new(ExecutorAction::new(
                ExecutorActionType::ScriptRequest(ScriptRequest {
                    script: script.clone(),
                    language: ScriptRequestLanguage::Bash,
                    context: ScriptContext::CleanupScript,
                    working_dir: Some(repo.name.clone()),
                }),
                tail,
            )));
        }
        tail
    }

    /// Standalone chain of one script kind across the workspace's repos.
    fn script_chain(
        repos: &[(WorkspaceRepo, Repo)],
        context: ScriptContext,
    ) -> Option<ExecutorAction> {
        let mut tail: Option<Box<ExecutorAction>> = None;
        for (_, repo) in repos.iter().rev() {
            let script = match context {
                ScriptContext::SetupScript => &repo.setup_script,
                ScriptContext::CleanupScript => &repo.cleanup_script,
                ScriptContext::ArchiveScript => &repo.archive_script,
                ScriptContext::DevServer => &repo.dev_server_script,
            };
            let Some(script) = script.as_ref().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            tail = Some(Box::new(ExecutorAction::new(
                ExecutorActionType::ScriptRequest(ScriptRequest {
                    script: script.clone(),
                    language: ScriptRequestLanguage::Bash,
                    context: context.clone(),
                    working_dir: Some(repo.name.clone()),
                }),
                tail,
            )));
        }
        tail.map(|boxed| *boxed)
    }

    fn run_reason_for(action: &ExecutorAction) -> ExecutionProcessRunReason {
        match action.typ() {
            ExecutorActionType::ScriptRequest(script) => match script.context {
                ScriptContext::SetupScript => ExecutionProcessRunReason::SetupScript,
                ScriptContext::CleanupScript => ExecutionProcessRunReason::CleanupScript,
                ScriptContext::ArchiveScript => ExecutionProcessRunReason::ArchiveScript,
                ScriptContext::DevServer => ExecutionProcessRunReason::DevServer,
            },
            ExecutorActionType::CodingAgentInitialRequest(_)
            | ExecutorActionType::CodingAgentFollowUpRequest(_)
            | ExecutorActionType::ReviewRequest(_) => ExecutionProcessRunReason::CodingAgent,
        }
    }

    /// Persist the process row, capture per-repo before-head commits, then
    /// hand off to the deployment to spawn the child. The row exists with
    /// status `running` before the process does; recovery relies on that.
    async fn start_execution(
        &self,
        workspace: &Workspace,
        session: &Session,
        executor_action: &ExecutorAction,
        run_reason: &ExecutionProcessRunReason,
    ) -> Result<ExecutionProcess, ContainerError> {
        let chain_lock = self.chain_lock_for(workspace.id).await;
        let _chain_guard = chain_lock.lock().await;

        let task = workspace
            .parent_task(&self.db().pool)
            .await?
            .ok_or(SqlxError::RowNotFound)?;
        if task.status != TaskStatus::InProgress
            && run_reason != &ExecutionProcessRunReason::DevServer
        {
            Task::update_status(&self.db().pool, task.id, TaskStatus::InProgress).await?;
        }

        let execution_process = ExecutionProcess::create(
            &self.db().pool,
            &CreateExecutionProcess {
                session_id: session.id,
                executor_action: executor_action.clone(),
                run_reason: *run_reason,
            },
            Uuid::new_v4(),
        )
        .await?;

        // Commit lineage: record where each repo's worktree stood when the
        // process began.
        let container_dir = self.workspace_to_container_dir(workspace);
        for (link, repo) in WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await? {
            let worktree = container_dir.join(&repo.name);
            let before = self.git().get_head_info(&worktree).ok().map(|h| h.oid);
            ExecutionProcessRepoState::create(
                &self.db().pool,
                execution_process.id,
                link.repo_id,
                before.as_deref(),
            )
            .await?;
        }

        let (prompt, executor_label) = match executor_action.typ() {
            ExecutorActionType::CodingAgentInitialRequest(req) => {
                (Some(req.prompt.clone()), Some(req.executor.to_string()))
            }
            ExecutorActionType::CodingAgentFollowUpRequest(req) => {
                (Some(req.prompt.clone()), Some(req.executor.to_string()))
            }
            ExecutorActionType::ReviewRequest(req) => {
                (Some(req.prompt.clone()), Some(req.executor.to_string()))
            }
            _ => (None, None),
        };

        if let Some(prompt) = &prompt {
            CodingAgentTurn::create(&self.db().pool, execution_process.id, Some(prompt)).await?;
            if let Some(executor) = &executor_label {
                Session::update_executor(&self.db().pool, session.id, executor).await?;
            }
            // First prompt doubles as the workspace display name
            let name: String = prompt.chars().take(80).collect();
            Workspace::update_name_if_empty(&self.db().pool, workspace.id, name.trim()).await?;
        }

        self.start_execution_inner(workspace, &execution_process, executor_action)
            .await?;

        // Attach the executor's normalizer to the fresh store, with the
        // user prompt pre-seeded as entry zero.
        match executor_action.typ() {
            ExecutorActionType::CodingAgentInitialRequest(req) => {
                self.attach_normalizer(&execution_process.id, workspace, &req.executor, &req.prompt)
                    .await;
            }
            ExecutorActionType::CodingAgentFollowUpRequest(req) => {
                self.attach_normalizer(&execution_process.id, workspace, &req.executor, &req.prompt)
                    .await;
            }
            ExecutorActionType::ReviewRequest(req) => {
                self.attach_normalizer(&execution_process.id, workspace, &req.executor, &req.prompt)
                    .await;
            }
            _ => {}
        }

        self.spawn_stream_raw_logs_to_db(&execution_process.id);
        Ok(execution_process)
    }

    async fn attach_normalizer(
        &self,
        exec_id: &Uuid,
        workspace: &Workspace,
        executor: &CodingAgent,
        prompt: &str,
    ) {
        let Some(msg_store) = self.get_msg_store_by_id(exec_id).await else {
            tracing::error!("No message store for fresh execution {exec_id}");
            return;
        };

        let user_entry = NormalizedEntry {
            timestamp: None,
            entry_type: NormalizedEntryType::UserMessage,
            content: prompt.to_string(),
            metadata: None,
        };
        msg_store.push_patch(ConversationPatch::add_normalized_entry(0, user_entry));

        let mut agent_dir = self.workspace_to_container_dir(workspace);
        if let Some(sub) = &workspace.agent_working_dir {
            agent_dir = agent_dir.join(sub);
        }
        executor.normalize_logs(msg_store, &agent_dir);
    }

    /// Mirror raw chunks into the durable log table and harvest the agent
    /// session id as it appears.
    fn spawn_stream_raw_logs_to_db(&self, execution_id: &Uuid) -> JoinHandle<()> {
        let execution_id = *execution_id;
        let msg_stores = self.msg_stores().clone();
        let db = self.db().clone();

        tokio::spawn(async move {
            let store = {
                let map = msg_stores.read().await;
                map.get(&execution_id).cloned()
            };
            let Some(store) = store else { return };

            let mut stream = store.history_plus_stream();
            while let Some(Ok(msg)) = stream.next().await {
                match &msg {
                    LogMsg::Stdout(_) | LogMsg::Stderr(_) => match serde_json::to_string(&msg) {
                        Ok(jsonl_line) => {
                            if let Err(e) = ExecutionProcessLogs::append_log_line(
                                &db.pool,
                                execution_id,
                                &format!("{jsonl_line}\n"),
                            )
                            .await
                            {
                                tracing::error!(
                                    "Failed to append log line for execution {execution_id}: {e}"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "Failed to serialize log message for execution {execution_id}: {e}"
                            );
                        }
                    },
                    LogMsg::SessionId(agent_session_id) => {
                        if let Err(e) = CodingAgentTurn::update_agent_session_id(
                            &db.pool,
                            execution_id,
                            agent_session_id,
                        )
                        .await
                        {
                            tracing::error!(
                                "Failed to record agent session id for {execution_id}: {e}"
                            );
                        }
                    }
                    LogMsg::Finished => break,
                    LogMsg::JsonPatch(_) | LogMsg::Truncated => continue,
                }
            }
        })
    }

    /// Advance the chain after `ctx`'s process finished successfully.
    /// Queued follow-ups preempt the stored tail when a coding agent
    /// completes. Returns whether another action was started.
    async fn try_start_next_action(&self, ctx: &ExecutionContext) -> Result<bool, ContainerError> {
        let action = ctx.execution_process.executor_action()?;

        if ctx.execution_process.run_reason == ExecutionProcessRunReason::CodingAgent
            && let Some(queued) =
                QueuedMessage::pop_oldest(&self.db().pool, ctx.session.id).await?
        {
            let follow_up = self
                .build_follow_up_action(&ctx.session, &ctx.workspace, queued.prompt)
                .await?;
            self.start_execution(
                &ctx.workspace,
                &ctx.session,
                &follow_up,
                &ExecutionProcessRunReason::CodingAgent,
            )
            .await?;
            return Ok(true);
        }

        let Some(next_action) = action.next_action() else {
            return Ok(false);
        };

        let run_reason = Self::run_reason_for(next_action);
        self.start_execution(&ctx.workspace, &ctx.session, next_action, &run_reason)
            .await?;
        Ok(true)
    }

    /// Resolve a prompt into a follow-up action resuming the session's most
    /// recent non-dropped turn, with the cleanup chain re-attached.
    async fn build_follow_up_action(
        &self,
        session: &Session,
        workspace: &Workspace,
        prompt: String,
    ) -> Result<ExecutorAction, ContainerError> {
        let latest_turn = CodingAgentTurn::find_latest_by_session_id(&self.db().pool, session.id)
            .await?
            .ok_or_else(|| anyhow!("No prior coding agent turn to resume from"))?;

        // The executor's own session id takes precedence; without one the
        // agent cannot resume.
        let agent_session_id = latest_turn
            .agent_session_id
            .ok_or_else(|| anyhow!("Latest turn has no agent session id"))?;

        let executor = self.latest_executor_for_session(session).await?;

        let repos = WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await?;

        Ok(ExecutorAction::new(
            ExecutorActionType::CodingAgentFollowUpRequest(CodingAgentFollowUpRequest {
                prompt,
                executor,
                session_id: agent_session_id,
                resume_message_id: latest_turn.agent_message_id,
            }),
            Self::cleanup_chain(&repos),
        ))
    }

    /// Executor of the session's latest coding-agent process, falling back
    /// to the default agent.
    async fn latest_executor_for_session(
        &self,
        session: &Session,
    ) -> Result<CodingAgent, ContainerError> {
        let processes =
            ExecutionProcess::find_by_session_id(&self.db().pool, session.id, false).await?;
        for process in processes.iter().rev() {
            if process.run_reason != ExecutionProcessRunReason::CodingAgent {
                continue;
            }
            if let Ok(action) = process.executor_action() {
                match action.typ() {
                    ExecutorActionType::CodingAgentInitialRequest(req) => {
                        return Ok(req.executor.clone());
                    }
                    ExecutorActionType::CodingAgentFollowUpRequest(req) => {
                        return Ok(req.executor.clone());
                    }
                    ExecutorActionType::ReviewRequest(req) => {
                        return Ok(req.executor.clone());
                    }
                    _ => {}
                }
            }
        }
        Ok(CodingAgent::default())
    }

    /// Run the agent over review feedback, resuming the session when its
    /// agent id is known.
    async fn start_review(
        &self,
        workspace: &Workspace,
        prompt: String,
    ) -> Result<ExecutionProcess, ContainerError> {
        self.ensure_container_exists(workspace).await?;
        let session = Session::find_or_create(&self.db().pool, workspace.id).await?;

        let agent_session_id =
            CodingAgentTurn::find_latest_by_session_id(&self.db().pool, session.id)
                .await?
                .and_then(|turn| turn.agent_session_id);
        let executor = self.latest_executor_for_session(&session).await?;
        let repos = WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await?;

        let action = ExecutorAction::new(
            ExecutorActionType::ReviewRequest(ReviewRequest {
                prompt,
                executor,
                session_id: agent_session_id,
            }),
            Self::cleanup_chain(&repos),
        );
        self.start_execution(
            workspace,
            &session,
            &action,
            &ExecutionProcessRunReason::CodingAgent,
        )
        .await
    }

    /// User-submitted follow-up: queued while an agent is running in the
    /// session, started immediately otherwise.
    async fn follow_up(
        &self,
        workspace: &Workspace,
        prompt: String,
    ) -> Result<FollowUpOutcome, ContainerError> {
        let session = Session::find_or_create(&self.db().pool, workspace.id).await?;

        let running =
            ExecutionProcess::find_running_by_workspace_id(&self.db().pool, workspace.id)
                .await?
                .into_iter()
                .any(|p| p.run_reason != ExecutionProcessRunReason::DevServer);

        if running {
            let queued = QueuedMessage::enqueue(&self.db().pool, session.id, &prompt).await?;
            return Ok(FollowUpOutcome::Queued(queued.id));
        }

        self.ensure_container_exists(workspace).await?;
        let action = self
            .build_follow_up_action(&session, workspace, prompt)
            .await?;
        let process = self
            .start_execution(
                workspace,
                &session,
                &action,
                &ExecutionProcessRunReason::CodingAgent,
            )
            .await?;
        Ok(FollowUpOutcome::Started(process))
    }

    /// Restore the session view to just before `boundary_process_id`:
    /// soft-drop it and everything after it, then optionally hard-reset
    /// each worktree to the last surviving after-head commit.
    async fn restore_to(
        &self,
        workspace: &Workspace,
        boundary_process_id: Uuid,
        perform_reset: bool,
        force_when_dirty: bool,
    ) -> Result<(), ContainerError> {
        let process = ExecutionProcess::find_by_id(&self.db().pool, boundary_process_id)
            .await?
            .ok_or(SqlxError::RowNotFound)?;
        let session = process
            .parent_session(&self.db().pool)
            .await?
            .ok_or(SqlxError::RowNotFound)?;
        if session.workspace_id != workspace.id {
            return Err(ContainerError::Other(anyhow!(
                "Execution process does not belong to this workspace"
            )));
        }

        ExecutionProcess::drop_at_and_after(&self.db().pool, session.id, boundary_process_id)
            .await?;

        if !perform_reset {
            return Ok(());
        }

        let container_dir = self.workspace_to_container_dir(workspace);
        for (link, repo) in WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await? {
            let Some(target) = ExecutionProcessRepoState::latest_after_head_commit(
                &self.db().pool,
                session.id,
                link.repo_id,
            )
            .await?
            else {
                continue;
            };

            let worktree = container_dir.join(&repo.name);
            let dirty = !self.git().is_worktree_clean(&worktree)?;
            if dirty && !force_when_dirty {
                tracing::info!(
                    "Skipping reset of dirty worktree {} after restore",
                    worktree.display()
                );
                continue;
            }
            self.git().hard_reset_to(&worktree, &target)?;
        }

        Ok(())
    }

    /// Raw stdout/stderr stream: live store first, then the durable JSONL
    /// mirror for finished processes.
    async fn stream_raw_logs(
        &self,
        id: &Uuid,
    ) -> Option<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>> {
        if let Some(store) = self.get_msg_store_by_id(id).await {
            let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            return Some(
                store
                    .history_plus_stream()
                    .filter(|msg| {
                        future::ready(matches!(msg, Ok(LogMsg::Stdout(..) | LogMsg::Stderr(..))))
                    })
                    .map_ok({
                        move |m| {
                            let index =
                                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            match m {
                                LogMsg::Stdout(content) => {
                                    LogMsg::JsonPatch(ConversationPatch::add_stdout(index, content))
                                        .to_sse_event()
                                }
                                LogMsg::Stderr(content) => {
                                    LogMsg::JsonPatch(ConversationPatch::add_stderr(index, content))
                                        .to_sse_event()
                                }
                                _ => unreachable!("filter passes only stdout/stderr"),
                            }
                        }
                    })
                    .boxed(),
            );
        }

        let logs_record = match ExecutionProcessLogs::find_by_execution_id(&self.db().pool, *id).await
        {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!("Failed to fetch logs for execution {id}: {e}");
                return None;
            }
        };
        let messages = match logs_record.parse_logs() {
            Ok(msgs) => msgs,
            Err(e) => {
                tracing::error!("Failed to parse logs for execution {id}: {e}");
                return None;
            }
        };

        let stream = futures::stream::iter(
            messages
                .into_iter()
                .filter(|m| matches!(m, LogMsg::Stdout(_) | LogMsg::Stderr(_)))
                .enumerate()
                .map(|(index, m)| {
                    let event = match m {
                        LogMsg::Stdout(content) => {
                            LogMsg::JsonPatch(ConversationPatch::add_stdout(index, content))
                                .to_sse_event()
                        }
                        LogMsg::Stderr(content) => {
                            LogMsg::JsonPatch(ConversationPatch::add_stderr(index, content))
                                .to_sse_event()
                        }
                        _ => unreachable!(),
                    };
                    Ok::<_, std::io::Error>(event)
                }),
        )
        .chain(futures::stream::once(async {
            Ok::<_, std::io::Error>(LogMsg::Finished.to_sse_event())
        }))
        .boxed();

        Some(stream)
    }

    /// Normalized entry stream. For finished processes the raw mirror is
    /// replayed through the executor's normalizer into a temporary store.
    async fn stream_normalized_logs(
        &self,
        id: &Uuid,
    ) -> Option<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>> {
        if let Some(store) = self.get_msg_store_by_id(id).await {
            return Some(
                store
                    .history_plus_stream()
                    .filter(|msg| future::ready(matches!(msg, Ok(LogMsg::JsonPatch(..)))))
                    .map_ok(|m| m.to_sse_event())
                    .boxed(),
            );
        }

        let logs_record = match ExecutionProcessLogs::find_by_execution_id(&self.db().pool, *id).await
        {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!("Failed to fetch logs for execution {id}: {e}");
                return None;
            }
        };
        let raw_messages = match logs_record.parse_logs() {
            Ok(msgs) => msgs,
            Err(e) => {
                tracing::error!("Failed to parse logs for execution {id}: {e}");
                return None;
            }
        };

        let process = ExecutionProcess::find_by_id(&self.db().pool, *id).await.ok()??;
        let ctx = ExecutionProcess::load_context(&self.db().pool, *id).await.ok()?;

        let temp_store = Arc::new(MsgStore::new());
        for msg in raw_messages {
            if matches!(msg, LogMsg::Stdout(_) | LogMsg::Stderr(_)) {
                temp_store.push(msg);
            }
        }

        let action = process.executor_action().ok()?;
        let (executor, prompt) = match action.typ() {
            ExecutorActionType::CodingAgentInitialRequest(req) => {
                (req.executor.clone(), req.prompt.clone())
            }
            ExecutorActionType::CodingAgentFollowUpRequest(req) => {
                (req.executor.clone(), req.prompt.clone())
            }
            ExecutorActionType::ReviewRequest(req) => (req.executor.clone(), req.prompt.clone()),
            _ => return None,
        };

        let user_entry = NormalizedEntry {
            timestamp: None,
            entry_type: NormalizedEntryType::UserMessage,
            content: prompt,
            metadata: None,
        };
        temp_store.push_patch(ConversationPatch::add_normalized_entry(0, user_entry));

        let current_dir = self.workspace_to_container_dir(&ctx.workspace);
        executor.normalize_logs(temp_store.clone(), &current_dir);

        // Seal once the normalizer has drained the replayed history
        {
            let temp_store = temp_store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                temp_store.push_finished();
            });
        }

        Some(
            temp_store
                .history_plus_stream()
                .filter(|msg| future::ready(matches!(msg, Ok(LogMsg::JsonPatch(..)))))
                .map_ok(|m| m.to_sse_event())
                .boxed(),
        )
    }

    /// Start a dev server for the workspace's repo carrying a dev script.
    async fn start_dev_server(
        &self,
        workspace: &Workspace,
        repo_id: Option<Uuid>,
    ) -> Result<ExecutionProcess, ContainerError> {
        self.ensure_container_exists(workspace).await?;
        let repos = WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await?;

        let (_, repo) = repos
            .iter()
            .find(|(link, repo)| {
                repo_id.map(|id| link.repo_id == id).unwrap_or(true)
                    && repo
                        .dev_server_script
                        .as_deref()
                        .is_some_and(|s| !s.trim().is_empty())
            })
            .ok_or_else(|| anyhow!("No repo with a dev server script"))?;

        let action = ExecutorAction::new(
            ExecutorActionType::ScriptRequest(ScriptRequest {
                script: repo.dev_server_script.clone().unwrap_or_default(),
                language: ScriptRequestLanguage::Bash,
                context: ScriptContext::DevServer,
                working_dir: Some(repo.name.clone()),
            }),
            None,
        );

        let session = Session::find_or_create(&self.db().pool, workspace.id).await?;
        self.start_execution(
            workspace,
            &session,
            &action,
            &ExecutionProcessRunReason::DevServer,
        )
        .await
    }

    /// Run one kind of script chain on demand, outside the main
    /// setup→agent→cleanup flow. Returns None when no repo carries a
    /// script of that kind.
    async fn run_script_chain(
        &self,
        workspace: &Workspace,
        context: ScriptContext,
    ) -> Result<Option<ExecutionProcess>, ContainerError> {
        self.ensure_container_exists(workspace).await?;
        let repos = WorkspaceRepo::find_with_repos(&self.db().pool, workspace.id).await?;
        let Some(action) = Self::script_chain(&repos, context) else {
            return Ok(None);
        };
        let run_reason = Self::run_reason_for(&action);
        let session = Session::find_or_create(&self.db().pool, workspace.id).await?;
        let process = self
            .start_execution(workspace, &session, &action, &run_reason)
            .await?;
        Ok(Some(process))
    }
}

#[derive(Debug)]
pub enum FollowUpOutcome {
    Started(ExecutionProcess),
    Queued(Uuid),
}
