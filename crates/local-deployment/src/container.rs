use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use async_stream::try_stream;
use async_trait::async_trait;
use axum::response::sse::Event;
use command_group::AsyncGroupChild;
use db::{
    DBService,
    models::{
        coding_agent_turn::CodingAgentTurn,
        execution_process::{
            ExecutionContext, ExecutionProcess, ExecutionProcessRunReason, ExecutionProcessStatus,
        },
        execution_process_repo_state::ExecutionProcessRepoState,
        image::TaskImage,
        task::{Task, TaskStatus},
        workspace::Workspace,
        workspace_repo::WorkspaceRepo,
    },
};
use executors::{
    actions::{Executable, ExecutorAction},
    logs::{NormalizedEntryType, utils::ConversationPatch},
};
use futures::{StreamExt, TryStreamExt, stream::select, stream::select_all};
use services::services::{
    config::Config,
    container::{ContainerError, ContainerRef, ContainerService},
    filesystem_watcher,
    git::{DiffTarget, GitService},
    notification::NotificationService,
    workspace_manager::{WorkspaceManager, WorkspaceRepoSpec},
};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::io::ReaderStream;
use utils::{
    log_msg::LogMsg,
    msg_store::MsgStore,
    text::{git_branch_id, short_uuid},
};
use uuid::Uuid;

use crate::command;

#[derive(Clone)]
pub struct LocalContainerService {
    db: DBService,
    child_store: Arc<RwLock<HashMap<Uuid, Arc<RwLock<AsyncGroupChild>>>>>,
    msg_stores: Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>>,
    chain_locks: Arc<tokio::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
    config: Arc<RwLock<Config>>,
    git: GitService,
    auto_commit: Arc<std::sync::atomic::AtomicBool>,
}

impl LocalContainerService {
    pub fn new(
        db: DBService,
        msg_stores: Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>>,
        config: Arc<RwLock<Config>>,
        git: GitService,
        auto_commit: bool,
    ) -> Self {
        LocalContainerService {
            db,
            child_store: Arc::new(RwLock::new(HashMap::new())),
            msg_stores,
            chain_locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            config,
            git,
            auto_commit: Arc::new(std::sync::atomic::AtomicBool::new(auto_commit)),
        }
    }

    pub async fn get_child_from_store(&self, id: &Uuid) -> Option<Arc<RwLock<AsyncGroupChild>>> {
        let map = self.child_store.read().await;
        map.get(id).cloned()
    }

    pub async fn add_child_to_store(&self, id: Uuid, exec: AsyncGroupChild) {
        let mut map = self.child_store.write().await;
        map.insert(id, Arc::new(RwLock::new(exec)));
    }

    pub async fn remove_child_from_store(&self, id: &Uuid) {
        let mut map = self.child_store.write().await;
        map.remove(id);
    }

    /// Kill every live child; used on shutdown and archival.
    pub async fn kill_all_running(&self) {
        let ids: Vec<Uuid> = {
            let map = self.child_store.read().await;
            map.keys().copied().collect()
        };
        for id in ids {
            if let Ok(Some(process)) = ExecutionProcess::find_by_id(&self.db.pool, id).await {
                let _ = self.stop_execution(&process).await;
            }
        }
    }

    fn dir_name_from_workspace(workspace_id: &Uuid, task_title: &str) -> String {
        format!("wh-{}-{}", short_uuid(workspace_id), git_branch_id(task_title))
    }

    fn git_branch_from_workspace(workspace_id: &Uuid, task_title: &str) -> String {
        format!("wh/{}-{}", short_uuid(workspace_id), git_branch_id(task_title))
    }

    async fn repo_specs(&self, workspace: &Workspace) -> Result<Vec<WorkspaceRepoSpec>, ContainerError> {
        let links = WorkspaceRepo::find_with_repos(&self.db.pool, workspace.id).await?;
        Ok(links
            .into_iter()
            .map(|(link, repo)| WorkspaceRepoSpec {
                repo_path: PathBuf::from(&repo.path),
                repo_name: repo.name,
                target_branch: link.target_branch,
            })
            .collect())
    }

    /// Pipe the child's stdio into a fresh message store for this
    /// execution.
    async fn track_child_msgs_in_store(&self, id: Uuid, child: &mut AsyncGroupChild) {
        let store = Arc::new(MsgStore::new());

        let out = child.inner().stdout.take().expect("no stdout");
        let err = child.inner().stderr.take().expect("no stderr");

        let out = ReaderStream::new(out)
            .map_ok(|chunk| LogMsg::Stdout(String::from_utf8_lossy(&chunk).into_owned()));
        let err = ReaderStream::new(err)
            .map_ok(|chunk| LogMsg::Stderr(String::from_utf8_lossy(&chunk).into_owned()));

        let merged = select(out, err);
        store.clone().spawn_forwarder(merged);

        let mut map = self.msg_stores().write().await;
        map.insert(id, store);
    }

    /// A finished chain finalizes its task when nothing else (dev servers
    /// aside) is still running for the workspace.
    async fn finalize_task(&self, ctx: &ExecutionContext) {
        match ExecutionProcess::has_running_non_dev_server(&self.db.pool, ctx.workspace.id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to check running processes for finalization: {e}");
                return;
            }
        }

        if ctx.task.status == TaskStatus::InProgress {
            if let Err(e) =
                Task::update_status(&self.db.pool, ctx.task.id, TaskStatus::InReview).await
            {
                tracing::error!("Failed to update task status to InReview: {e}");
            }
            let notify_cfg = self.config.read().await.notifications.clone();
            NotificationService::notify_execution_halted(notify_cfg, ctx).await;
        }
    }

    /// Pull the last assistant message out of the store for the turn
    /// summary, along with the executor's message id when present.
    async fn harvest_turn_outputs(&self, exec_id: &Uuid) {
        let Some(store) = self.get_msg_store_by_id(exec_id).await else {
            return;
        };

        let mut summary: Option<String> = None;
        let mut message_id: Option<String> = None;
        for msg in store.get_history() {
            if let LogMsg::JsonPatch(patch) = msg {
                for (_, entry) in ConversationPatch::extract_normalized_entries(&patch) {
                    if matches!(entry.entry_type, NormalizedEntryType::AssistantMessage) {
                        if let Some(id) = entry.agent_message_id() {
                            message_id = Some(id.to_string());
                        }
                        let content = entry.content.trim().to_string();
                        if !content.is_empty() {
                            const MAX_SUMMARY_LENGTH: usize = 4096;
                            summary = Some(if content.len() > MAX_SUMMARY_LENGTH {
                                let cut: String = content.chars().take(MAX_SUMMARY_LENGTH).collect();
                                format!("{cut}...")
                            } else {
                                content
                            });
                        }
                    }
                }
            }
        }

        if let Some(summary) = summary
            && let Err(e) = CodingAgentTurn::update_summary(&self.db.pool, *exec_id, &summary).await
        {
            tracing::warn!("Failed to update turn summary for {exec_id}: {e}");
        }
        if let Some(message_id) = message_id
            && let Err(e) =
                CodingAgentTurn::update_agent_message_id(&self.db.pool, *exec_id, &message_id).await
        {
            tracing::warn!("Failed to update turn message id for {exec_id}: {e}");
        }
    }

    /// Record the post-run HEAD of every repo worktree. Runs after
    /// auto-commit and before the next action starts, so consecutive
    /// processes share a continuous before/after lineage.
    async fn capture_after_head_commits(&self, ctx: &ExecutionContext) {
        let container_dir = self.workspace_to_container_dir(&ctx.workspace);
        let repos = match WorkspaceRepo::find_with_repos(&self.db.pool, ctx.workspace.id).await {
            Ok(repos) => repos,
            Err(e) => {
                tracing::error!("Failed to load workspace repos for after-head capture: {e}");
                return;
            }
        };

        for (link, repo) in repos {
            let worktree = container_dir.join(&repo.name);
            let Ok(head) = self.git.get_head_info(&worktree) else {
                continue;
            };
            if let Err(e) = ExecutionProcessRepoState::update_after_head_commit(
                &self.db.pool,
                ctx.execution_process.id,
                link.repo_id,
                &head.oid,
            )
            .await
            {
                tracing::warn!(
                    "Failed to update after_head_commit for {}: {e}",
                    ctx.execution_process.id
                );
            }
        }
    }

    /// Exactly one exit monitor runs per spawned child. It owns the
    /// terminal transition of the process row and everything that follows
    /// from it: repo-state capture, chain advancement, finalization.
    pub fn spawn_exit_monitor(&self, exec_id: &Uuid) -> JoinHandle<()> {
        let exec_id = *exec_id;
        let container = self.clone();

        tokio::spawn(async move {
            loop {
                let status_opt = {
                    let child_lock = {
                        let map = container.child_store.read().await;
                        map.get(&exec_id).cloned()
                    };
                    let Some(child_lock) = child_lock else {
                        // stop_execution already reaped this child
                        break;
                    };

                    let mut child = child_lock.write().await;
                    match child.try_wait() {
                        Ok(Some(status)) => Some(Ok(status)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    }
                };

                if let Some(status_result) = status_opt {
                    container.handle_exit(exec_id, status_result).await;
                    break;
                }

                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
    }

    async fn handle_exit(
        &self,
        exec_id: Uuid,
        status_result: Result<std::process::ExitStatus, io::Error>,
    ) {
        // Let the stdio forwarders drain the final chunks before anything
        // reads the store or seals it.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (exit_code, status) = match status_result {
            Ok(exit_status) => {
                let code = exit_status.code().unwrap_or(-1) as i64;
                let status = if exit_status.success() {
                    ExecutionProcessStatus::Completed
                } else {
                    ExecutionProcessStatus::Failed
                };
                (Some(code), status)
            }
            Err(_) => (None, ExecutionProcessStatus::Failed),
        };

        // An explicit stop already wrote `killed`; update_completion leaves
        // terminal rows untouched either way.
        if !ExecutionProcess::was_killed(&self.db.pool, exec_id).await
            && let Err(e) =
                ExecutionProcess::update_completion(&self.db.pool, exec_id, status, exit_code).await
        {
            tracing::error!("Failed to update execution process completion: {e}");
        }

        if let Ok(ctx) = ExecutionProcess::load_context(&self.db.pool, exec_id).await {
            if ctx.execution_process.run_reason == ExecutionProcessRunReason::CodingAgent {
                self.harvest_turn_outputs(&exec_id).await;
            }

            let succeeded = ctx.execution_process.status == ExecutionProcessStatus::Completed
                && exit_code == Some(0);

            if succeeded {
                if ctx.execution_process.run_reason == ExecutionProcessRunReason::SetupScript
                    && let Err(e) =
                        Workspace::update_setup_completed(&self.db.pool, ctx.workspace.id).await
                {
                    tracing::warn!("Failed to record setup completion: {e}");
                }

                if let Err(e) = self.try_commit_changes(&ctx).await {
                    tracing::error!("Failed to commit changes after execution: {e}");
                }
            }

            // After-head capture happens after auto-commit and before the
            // next action spawns.
            self.capture_after_head_commits(&ctx).await;

            if ctx.execution_process.run_reason != ExecutionProcessRunReason::DevServer {
                let started_next = if succeeded {
                    match self.try_start_next_action(&ctx).await {
                        Ok(started) => started,
                        Err(e) => {
                            tracing::error!("Failed to start next action after completion: {e}");
                            false
                        }
                    }
                } else {
                    false
                };

                if !started_next {
                    self.finalize_task(&ctx).await;
                }
            }
        }

        // Seal and release the message store
        if let Some(msg_arc) = self.msg_stores.write().await.remove(&exec_id) {
            msg_arc.push_finished();
            tokio::time::sleep(Duration::from_millis(50)).await; // let Finished propagate
            match Arc::try_unwrap(msg_arc) {
                Ok(inner) => drop(inner),
                Err(arc) => tracing::debug!(
                    "There are still {} strong Arcs to MsgStore for {exec_id}",
                    Arc::strong_count(&arc)
                ),
            }
        }

        self.child_store.write().await.remove(&exec_id);
    }
}

#[async_trait]
impl ContainerService for LocalContainerService {
    fn msg_stores(&self) -> &Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>> {
        &self.msg_stores
    }

    fn chain_locks(&self) -> &Arc<tokio::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>> {
        &self.chain_locks
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn git(&self) -> &GitService {
        &self.git
    }

    fn auto_commit_enabled(&self) -> bool {
        self.auto_commit.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn workspace_to_container_dir(&self, workspace: &Workspace) -> PathBuf {
        PathBuf::from(workspace.container_ref.clone().unwrap_or_default())
    }

    async fn create(&self, workspace: &Workspace) -> Result<ContainerRef, ContainerError> {
        let task = workspace
            .parent_task(&self.db.pool)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let dir_name = Self::dir_name_from_workspace(&workspace.id, &task.title);
        let container_dir = utils::assets::workspace_base_dir().join(&dir_name);
        let branch = workspace
            .branch
            .clone()
            .unwrap_or_else(|| Self::git_branch_from_workspace(&workspace.id, &task.title));

        let specs = self.repo_specs(workspace).await?;
        WorkspaceManager::create(&container_dir, &specs, &branch).await?;

        // Task image attachments become available to the agent under the
        // container's .images directory.
        let images = TaskImage::find_by_task_id(&self.db.pool, task.id).await?;
        if !images.is_empty() {
            let image_dir = container_dir.join(".images");
            std::fs::create_dir_all(&image_dir)?;
            for image in images {
                let source = PathBuf::from(&image.file_path);
                let Some(file_name) = source.file_name() else {
                    continue;
                };
                if let Err(e) = std::fs::copy(&source, image_dir.join(file_name)) {
                    tracing::warn!("Failed to copy task image {}: {e}", source.display());
                }
            }
        }

        for (link, repo) in WorkspaceRepo::find_with_repos(&self.db.pool, workspace.id).await? {
            WorkspaceRepo::update_worktree_path(
                &self.db.pool,
                workspace.id,
                link.repo_id,
                &container_dir.join(&repo.name).to_string_lossy(),
            )
            .await?;
        }

        Workspace::update_container_ref(
            &self.db.pool,
            workspace.id,
            &container_dir.to_string_lossy(),
        )
        .await?;
        Workspace::update_branch(&self.db.pool, workspace.id, &branch).await?;

        Ok(container_dir.to_string_lossy().to_string())
    }

    async fn delete_inner(&self, workspace: &Workspace) -> Result<(), ContainerError> {
        let Some(container_ref) = &workspace.container_ref else {
            return Ok(());
        };
        let container_dir = PathBuf::from(container_ref);
        let specs = self.repo_specs(workspace).await?;

        // Release the container ref before touching the filesystem so the
        // uniqueness invariant holds even if cleanup is interrupted.
        Workspace::clear_container_ref(&self.db.pool, workspace.id).await?;

        WorkspaceManager::cleanup(&container_dir, &specs)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(
                    "Failed to clean up workspace {} container: {e}",
                    workspace.id
                );
            });
        Ok(())
    }

    async fn ensure_container_exists(
        &self,
        workspace: &Workspace,
    ) -> Result<ContainerRef, ContainerError> {
        let Some(container_ref) = workspace.container_ref.clone() else {
            return self.create(workspace).await;
        };
        let branch = workspace
            .branch
            .clone()
            .ok_or_else(|| ContainerError::Other(anyhow!("Workspace has no branch")))?;

        let specs = self.repo_specs(workspace).await?;
        WorkspaceManager::ensure(&PathBuf::from(&container_ref), &specs, &branch).await?;
        Ok(container_ref)
    }

    async fn is_container_clean(&self, workspace: &Workspace) -> Result<bool, ContainerError> {
        let Some(container_ref) = &workspace.container_ref else {
            return Ok(true);
        };
        let container_dir = PathBuf::from(container_ref);
        for spec in self.repo_specs(workspace).await? {
            let worktree = spec.worktree_path(&container_dir);
            if !worktree.exists() {
                continue;
            }
            if !self.git.is_worktree_clean(&worktree)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn start_execution_inner(
        &self,
        workspace: &Workspace,
        execution_process: &ExecutionProcess,
        executor_action: &ExecutorAction,
    ) -> Result<(), ContainerError> {
        let container_ref = workspace
            .container_ref
            .as_ref()
            .ok_or(ContainerError::Other(anyhow!(
                "Container ref not found for workspace"
            )))?;
        let mut current_dir = PathBuf::from(container_ref);
        if matches!(
            executor_action.typ(),
            executors::actions::ExecutorActionType::CodingAgentInitialRequest(_)
                | executors::actions::ExecutorActionType::CodingAgentFollowUpRequest(_)
                | executors::actions::ExecutorActionType::ReviewRequest(_)
        ) && let Some(sub) = &workspace.agent_working_dir
        {
            current_dir = current_dir.join(sub);
        }

        let mut child = executor_action.spawn(&current_dir).await?;

        self.track_child_msgs_in_store(execution_process.id, &mut child)
            .await;
        self.add_child_to_store(execution_process.id, child).await;

        let _hn = self.spawn_exit_monitor(&execution_process.id);

        Ok(())
    }

    async fn stop_execution(
        &self,
        execution_process: &ExecutionProcess,
    ) -> Result<(), ContainerError> {
        let child = self
            .get_child_from_store(&execution_process.id)
            .await
            .ok_or_else(|| ContainerError::Other(anyhow!("Child process not found for execution")))?;

        // Mark killed first so the exit monitor preserves the status.
        ExecutionProcess::update_completion(
            &self.db.pool,
            execution_process.id,
            ExecutionProcessStatus::Killed,
            None,
        )
        .await?;

        {
            let mut child_guard = child.write().await;
            if let Err(e) = command::kill_process_group(&mut child_guard).await {
                tracing::error!(
                    "Failed to stop execution process {}: {e}",
                    execution_process.id
                );
                return Err(e);
            }
        }
        self.remove_child_from_store(&execution_process.id).await;

        if let Some(msg) = self.msg_stores.write().await.remove(&execution_process.id) {
            msg.push_finished();
        }

        if let Ok(ctx) = ExecutionProcess::load_context(&self.db.pool, execution_process.id).await {
            self.capture_after_head_commits(&ctx).await;

            if ctx.execution_process.run_reason != ExecutionProcessRunReason::DevServer
                && ctx.task.status == TaskStatus::InProgress
                && let Err(e) =
                    Task::update_status(&self.db.pool, ctx.task.id, TaskStatus::InReview).await
            {
                tracing::error!("Failed to update task status to InReview: {e}");
            }
        }

        tracing::debug!("Execution process {} stopped", execution_process.id);
        Ok(())
    }

    async fn try_commit_changes(&self, ctx: &ExecutionContext) -> Result<bool, ContainerError> {
        if !matches!(
            ctx.execution_process.run_reason,
            ExecutionProcessRunReason::CodingAgent | ExecutionProcessRunReason::CleanupScript,
        ) {
            return Ok(false);
        }
        if !self.auto_commit_enabled() {
            return Ok(false);
        }

        let message = match ctx.execution_process.run_reason {
            ExecutionProcessRunReason::CodingAgent => {
                match CodingAgentTurn::find_by_execution_process_id(
                    &self.db.pool,
                    ctx.execution_process.id,
                )
                .await
                {
                    Ok(Some(turn)) if turn.summary.is_some() => turn.summary.unwrap(),
                    _ => format!(
                        "Commit changes from coding agent for workspace {}",
                        ctx.workspace.id
                    ),
                }
            }
            _ => format!("Cleanup script changes for workspace {}", ctx.workspace.id),
        };

        let container_dir = self.workspace_to_container_dir(&ctx.workspace);
        let mut committed_any = false;
        for spec in self.repo_specs(&ctx.workspace).await? {
            let worktree = spec.worktree_path(&container_dir);
            if !worktree.exists() {
                continue;
            }
            match self.git.commit(&worktree, &message) {
                Ok(true) => committed_any = true,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "Auto-commit failed in {} for workspace {}: {e}",
                        spec.repo_name,
                        ctx.workspace.id
                    );
                }
            }
        }
        Ok(committed_any)
    }

    /// Combined diff stream over every repo of the workspace: an initial
    /// snapshot per repo followed by watcher-driven updates, with entries
    /// keyed `repo_name/path`.
    async fn get_diff(
        &self,
        workspace: &Workspace,
    ) -> Result<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>, ContainerError>
    {
        self.ensure_container_exists(workspace).await?;
        let container_dir = self.workspace_to_container_dir(workspace);

        let mut streams = Vec::new();
        for spec in self.repo_specs(workspace).await? {
            let worktree = spec.worktree_path(&container_dir);
            let repo_name = spec.repo_name.clone();
            let target_branch = spec.target_branch.clone();
            let git = self.git.clone();

            let initial = git.get_diffs(
                DiffTarget::Worktree {
                    worktree_path: &worktree,
                    target_branch: &target_branch,
                },
                None,
            )?;

            let initial_stream = futures::stream::iter(initial.into_iter().map({
                let repo_name = repo_name.clone();
                move |diff| {
                    let key = diff_key(&repo_name, &diff.path());
                    let patch = ConversationPatch::add_diff(key, diff);
                    Ok::<_, io::Error>(LogMsg::JsonPatch(patch).to_sse_event())
                }
            }))
            .boxed();

            let live_stream = {
                let git = git.clone();
                try_stream! {
                    let (_debouncer, mut rx, canonical_worktree_path) =
                        filesystem_watcher::async_watcher(worktree.clone())
                            .map_err(|e| io::Error::other(e.to_string()))?;

                    while let Some(result) = rx.next().await {
                        match result {
                            Ok(events) => {
                                let changed_paths: Vec<String> = events
                                    .iter()
                                    .flat_map(|event| &event.paths)
                                    .filter_map(|path| {
                                        path.strip_prefix(&canonical_worktree_path)
                                            .or_else(|_| path.strip_prefix(&worktree))
                                            .ok()
                                            .map(|p| p.to_string_lossy().replace('\\', "/"))
                                    })
                                    .filter(|s| !s.is_empty())
                                    .collect();

                                if changed_paths.is_empty() {
                                    continue;
                                }

                                let path_filter: Vec<&str> =
                                    changed_paths.iter().map(|s| s.as_str()).collect();
                                let diffs = git
                                    .get_diffs(
                                        DiffTarget::Worktree {
                                            worktree_path: &worktree,
                                            target_branch: &target_branch,
                                        },
                                        Some(&path_filter),
                                    )
                                    .map_err(|e| io::Error::other(e.to_string()))?;

                                let mut files_with_diffs = HashSet::new();
                                for diff in diffs {
                                    let path = diff.path();
                                    files_with_diffs.insert(path.clone());
                                    let patch =
                                        ConversationPatch::add_diff(diff_key(&repo_name, &path), diff);
                                    yield LogMsg::JsonPatch(patch).to_sse_event();
                                }

                                // Paths that changed but no longer differ
                                for changed in &changed_paths {
                                    if !files_with_diffs.contains(changed) {
                                        let patch = ConversationPatch::remove_diff(
                                            diff_key(&repo_name, changed),
                                        );
                                        yield LogMsg::JsonPatch(patch).to_sse_event();
                                    }
                                }
                            }
                            Err(errors) => {
                                let error_msg = errors
                                    .iter()
                                    .map(|e| e.to_string())
                                    .collect::<Vec<_>>()
                                    .join("; ");
                                tracing::error!("Filesystem watcher error: {error_msg}");
                                Err(io::Error::other(error_msg))?;
                            }
                        }
                    }
                }
            }
            .boxed();

            streams.push(select(initial_stream, live_stream).boxed());
        }

        if streams.is_empty() {
            return Ok(futures::stream::empty().boxed());
        }
        Ok(select_all(streams).boxed())
    }
}

fn diff_key(repo_name: &str, path: &str) -> String {
    executors::logs::utils::patch::escape_json_pointer_segment(&format!("{repo_name}/{path}"))
}
