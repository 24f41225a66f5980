use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, time::Duration};

use db::{
    DBService,
    models::{
        execution_process::{
            ExecutionProcess, ExecutionProcessRunReason, ExecutionProcessStatus,
        },
        execution_process_repo_state::ExecutionProcessRepoState,
        project::{CreateProject, Project},
        repo::{CreateRepo, Repo},
        session::Session,
        task::{CreateTask, Task, TaskStatus},
        workspace::{CreateWorkspace, Workspace},
        workspace_repo::WorkspaceRepo,
    },
};
use executors::executors::{CodingAgent, echo::Echo};
use local_deployment::container::LocalContainerService;
use services::services::{
    config::Config,
    container::{ContainerService, FollowUpOutcome},
    git::GitService,
    workspace_manager::{WorkspaceManager, WorkspaceRepoSpec},
};
use tempfile::TempDir;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Harness {
    container: LocalContainerService,
    db: DBService,
    workspace: Workspace,
    workspace_dir: PathBuf,
    repo_path: PathBuf,
    repo_id: Uuid,
    task: Task,
    _td: TempDir,
}

fn echo_agent(delay_secs: u64) -> CodingAgent {
    CodingAgent::Echo(Echo {
        delay_secs: Some(delay_secs),
    })
}

async fn setup(setup_script: Option<&str>, dev_server_script: Option<&str>) -> Harness {
    let td = TempDir::new().unwrap();
    let db = DBService::new(&td.path().join("test.db")).await.unwrap();

    // Seed a repo on disk plus its registration row
    let repo_path = td.path().join("demo");
    let git = GitService::new();
    git.initialize_repo_with_main_branch(&repo_path).unwrap();
    git.configure_user(&repo_path, "Test User", "test@example.com")
        .unwrap();
    fs::write(repo_path.join("README.md"), "# demo\n").unwrap();
    git.commit(&repo_path, "seed").unwrap();

    let repo = Repo::create(
        &db.pool,
        &CreateRepo {
            path: repo_path.to_string_lossy().to_string(),
            name: "demo".to_string(),
            setup_script: setup_script.map(str::to_string),
            cleanup_script: None,
            archive_script: None,
            dev_server_script: dev_server_script.map(str::to_string),
            parallel_setup_script: false,
            default_target_branch: Some("main".to_string()),
            default_working_dir: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();

    let project = Project::create(
        &db.pool,
        &CreateProject {
            name: "P1".to_string(),
            repo_ids: vec![repo.id],
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();

    let task = Task::create(
        &db.pool,
        &CreateTask {
            project_id: project.id,
            title: "hello".to_string(),
            description: None,
            parent_workspace_id: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();

    let workspace = Workspace::create(
        &db.pool,
        &CreateWorkspace {
            task_id: task.id,
            repo_id: repo.id,
            base_branch: Some("main".to_string()),
            branch_name: Some("ws/abcd".to_string()),
            name: None,
            agent_working_dir: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();
    WorkspaceRepo::create(&db.pool, workspace.id, repo.id, "main")
        .await
        .unwrap();

    // Materialize the container into the test's own base directory so the
    // engine's lazy create path is not hit.
    let workspace_dir = td.path().join("workspaces").join(workspace.id.to_string());
    let specs = vec![WorkspaceRepoSpec {
        repo_path: repo_path.clone(),
        repo_name: "demo".to_string(),
        target_branch: "main".to_string(),
    }];
    WorkspaceManager::create(&workspace_dir, &specs, "ws/abcd")
        .await
        .unwrap();
    Workspace::update_container_ref(&db.pool, workspace.id, &workspace_dir.to_string_lossy())
        .await
        .unwrap();
    Workspace::update_branch(&db.pool, workspace.id, "ws/abcd")
        .await
        .unwrap();

    let container = LocalContainerService::new(
        db.clone(),
        Arc::new(RwLock::new(HashMap::new())),
        Arc::new(RwLock::new(Config::default())),
        git,
        true,
    );

    let workspace = Workspace::find_by_id(&db.pool, workspace.id)
        .await
        .unwrap()
        .unwrap();

    Harness {
        container,
        db,
        workspace,
        workspace_dir,
        repo_path,
        repo_id: repo.id,
        task,
        _td: td,
    }
}

async fn session_processes(db: &DBService, workspace_id: Uuid) -> Vec<ExecutionProcess> {
    ExecutionProcess::find_by_workspace_id(&db.pool, workspace_id)
        .await
        .unwrap()
}

/// Poll until the workspace has exactly `expected` processes and every one
/// of them completed successfully.
async fn wait_all_completed(db: &DBService, workspace_id: Uuid, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let processes = session_processes(db, workspace_id).await;
        if processes.len() == expected
            && processes
                .iter()
                .all(|p| p.status == ExecutionProcessStatus::Completed)
        {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "workspace never reached {expected} completed processes; current: {:?}",
                processes
                    .iter()
                    .map(|p| (p.run_reason, p.status))
                    .collect::<Vec<_>>()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_task_status(db: &DBService, task_id: Uuid, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let task = Task::find_by_id(&db.pool, task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task never reached {status:?}, last seen {:?}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_process_status(db: &DBService, process_id: Uuid, status: ExecutionProcessStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let process = ExecutionProcess::find_by_id(&db.pool, process_id)
            .await
            .unwrap()
            .unwrap();
        if process.status == status {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "process never reached {status:?}, last seen {:?}",
                process.status
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn setup_then_agent_chain_runs_serially_and_finalizes() {
    let h = setup(Some("echo ok > setup-ran.txt"), None).await;

    let first = h
        .container
        .start_workspace(&h.workspace, "write README".to_string(), echo_agent(0))
        .await
        .unwrap();
    assert_eq!(first.run_reason, ExecutionProcessRunReason::SetupScript);

    // Setup runs, then the agent, then the chain ends and the task is
    // finalized to InReview.
    wait_all_completed(&h.db, h.workspace.id, 2).await;

    let processes = session_processes(&h.db, h.workspace.id).await;
    assert_eq!(processes[0].run_reason, ExecutionProcessRunReason::SetupScript);
    assert_eq!(processes[0].exit_code, Some(0));
    assert_eq!(processes[1].run_reason, ExecutionProcessRunReason::CodingAgent);

    // Chain serial: the agent was created only after setup completed
    assert!(processes[0].completed_at.unwrap() <= processes[1].created_at);

    // The setup script ran inside the repo worktree
    assert!(h.workspace_dir.join("demo").join("setup-ran.txt").exists());

    wait_task_status(&h.db, h.task.id, TaskStatus::InReview).await;

    // Lineage: the agent's before-head equals the setup's after-head
    let setup_state = ExecutionProcessRepoState::find_by_process_and_repo(
        &h.db.pool,
        processes[0].id,
        h.repo_id,
    )
    .await
    .unwrap()
    .unwrap();
    let agent_state = ExecutionProcessRepoState::find_by_process_and_repo(
        &h.db.pool,
        processes[1].id,
        h.repo_id,
    )
    .await
    .unwrap()
    .unwrap();
    assert!(setup_state.after_head_commit.is_some());
    assert_eq!(agent_state.before_head_commit, setup_state.after_head_commit);
}

#[tokio::test]
async fn auto_commit_captures_agent_changes() {
    let h = setup(Some("echo generated > artifact.txt"), None).await;

    let before_head = GitService::new()
        .get_head_info(&h.workspace_dir.join("demo"))
        .unwrap()
        .oid;

    h.container
        .start_workspace(&h.workspace, "make an artifact".to_string(), echo_agent(0))
        .await
        .unwrap();

    wait_all_completed(&h.db, h.workspace.id, 2).await;

    // The setup script dirtied the worktree; the agent's exit committed it
    let after_head = GitService::new()
        .get_head_info(&h.workspace_dir.join("demo"))
        .unwrap()
        .oid;
    assert_ne!(before_head, after_head);
    assert!(
        GitService::new()
            .is_worktree_clean(&h.workspace_dir.join("demo"))
            .unwrap()
    );
}

#[tokio::test]
async fn queued_follow_up_starts_after_agent_completes() {
    let h = setup(None, None).await;

    h.container
        .start_workspace(&h.workspace, "first".to_string(), echo_agent(3))
        .await
        .unwrap();

    // Submit while the agent is still running: must queue, not start
    let outcome = h
        .container
        .follow_up(&h.workspace, "and then a follow-up".to_string())
        .await
        .unwrap();
    assert!(matches!(outcome, FollowUpOutcome::Queued(_)));

    wait_all_completed(&h.db, h.workspace.id, 2).await;

    let processes = session_processes(&h.db, h.workspace.id).await;
    let follow_up = &processes[1];
    assert_eq!(follow_up.run_reason, ExecutionProcessRunReason::CodingAgent);
    let action = follow_up.executor_action().unwrap();
    match action.typ() {
        executors::actions::ExecutorActionType::CodingAgentFollowUpRequest(req) => {
            assert_eq!(req.prompt, "and then a follow-up");
            assert_eq!(req.session_id, "echo-session");
        }
        other => panic!("expected follow-up action, got {other:?}"),
    }
}

#[tokio::test]
async fn dev_server_does_not_gate_finalization() {
    let h = setup(None, Some("sleep 30")).await;

    let dev = h
        .container
        .start_dev_server(&h.workspace, None)
        .await
        .unwrap();
    assert_eq!(dev.run_reason, ExecutionProcessRunReason::DevServer);

    h.container
        .start_workspace(&h.workspace, "quick run".to_string(), echo_agent(0))
        .await
        .unwrap();

    wait_task_status(&h.db, h.task.id, TaskStatus::InReview).await;

    // The dev server is still running while the task is already in review
    let dev = ExecutionProcess::find_by_id(&h.db.pool, dev.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dev.status, ExecutionProcessStatus::Running);

    h.container.stop_execution(&dev).await.unwrap();
    let dev = ExecutionProcess::find_by_id(&h.db.pool, dev.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dev.status, ExecutionProcessStatus::Killed);
}

#[tokio::test]
async fn stop_preserves_killed_status() {
    let h = setup(None, None).await;

    let process = h
        .container
        .start_workspace(&h.workspace, "long run".to_string(), echo_agent(30))
        .await
        .unwrap();

    // Give the child a moment to spawn, then stop it
    tokio::time::sleep(Duration::from_millis(500)).await;
    let process = ExecutionProcess::find_by_id(&h.db.pool, process.id)
        .await
        .unwrap()
        .unwrap();
    h.container.stop_execution(&process).await.unwrap();

    wait_process_status(&h.db, process.id, ExecutionProcessStatus::Killed).await;

    // Exit monotonicity: the exit monitor must not rewrite the status
    tokio::time::sleep(Duration::from_secs(1)).await;
    let p = ExecutionProcess::find_by_id(&h.db.pool, process.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(p.status, ExecutionProcessStatus::Killed);
    assert_eq!(p.exit_code, None);
}

#[tokio::test]
async fn restore_drops_boundary_and_later_and_resets_worktree() {
    let h = setup(None, None).await;
    let git = GitService::new();
    let worktree = h.workspace_dir.join("demo");

    // Two agent runs, each leaving a commit
    h.container
        .start_workspace(&h.workspace, "first".to_string(), echo_agent(0))
        .await
        .unwrap();
    wait_all_completed(&h.db, h.workspace.id, 1).await;
    fs::write(worktree.join("one.txt"), "1\n").unwrap();
    git.commit(&worktree, "commit A").unwrap();
    let commit_a = git.get_head_info(&worktree).unwrap().oid;
    // Stamp commit A as the first run's after-state, as the exit monitor
    // would have if the agent itself had made the commit.
    let processes = session_processes(&h.db, h.workspace.id).await;
    ExecutionProcessRepoState::update_after_head_commit(
        &h.db.pool,
        processes[0].id,
        h.repo_id,
        &commit_a,
    )
    .await
    .unwrap();

    let outcome = h
        .container
        .follow_up(&h.workspace, "second".to_string())
        .await
        .unwrap();
    let second = match outcome {
        FollowUpOutcome::Started(p) => p,
        other => panic!("expected immediate start, got {other:?}"),
    };
    wait_all_completed(&h.db, h.workspace.id, 2).await;
    fs::write(worktree.join("two.txt"), "2\n").unwrap();
    git.commit(&worktree, "commit B").unwrap();
    let commit_b = git.get_head_info(&worktree).unwrap().oid;
    ExecutionProcessRepoState::update_after_head_commit(
        &h.db.pool,
        second.id,
        h.repo_id,
        &commit_b,
    )
    .await
    .unwrap();

    // Restore to just before the second run
    h.container
        .restore_to(&h.workspace, second.id, true, false)
        .await
        .unwrap();

    let session = Session::find_latest_by_workspace_id(&h.db.pool, h.workspace.id)
        .await
        .unwrap()
        .unwrap();
    let visible = ExecutionProcess::find_by_session_id(&h.db.pool, session.id, false)
        .await
        .unwrap();
    let all = ExecutionProcess::find_by_session_id(&h.db.pool, session.id, true)
        .await
        .unwrap();
    assert_eq!(visible.len(), 1, "history view ends before the boundary");
    assert!(!visible[0].dropped);
    assert_eq!(all.len(), 2, "dropped rows are physically retained");
    assert!(all[1].dropped);

    // The worktree was hard-reset to the first run's after-state
    assert_eq!(git.get_head_info(&worktree).unwrap().oid, commit_a);
    assert!(worktree.join("one.txt").exists());
    assert!(!worktree.join("two.txt").exists());

    let _ = h.repo_path;
}

#[tokio::test]
async fn recovery_reclassifies_running_rows_and_backfills_lineage() {
    let h = setup(None, None).await;

    // A run that completes normally, leaving an after-head commit
    h.container
        .start_workspace(&h.workspace, "first".to_string(), echo_agent(0))
        .await
        .unwrap();
    wait_all_completed(&h.db, h.workspace.id, 1).await;

    // Simulate a crash: a row left `running` with no child attached, and a
    // repo state missing its before-head.
    let session = Session::find_latest_by_workspace_id(&h.db.pool, h.workspace.id)
        .await
        .unwrap()
        .unwrap();
    let orphan_id = Uuid::new_v4();
    sqlx::query(
        r#"INSERT INTO execution_processes (id, session_id, status, run_reason, executor_action)
           VALUES ($1, $2, 'running', 'codingagent', '{}')"#,
    )
    .bind(orphan_id)
    .bind(session.id)
    .execute(&h.db.pool)
    .await
    .unwrap();
    let head = GitService::new()
        .get_head_info(&h.workspace_dir.join("demo"))
        .unwrap()
        .oid;
    sqlx::query(
        r#"INSERT INTO execution_process_repo_states (id, execution_process_id, repo_id, after_head_commit)
           VALUES ($1, $2, $3, $4)"#,
    )
    .bind(Uuid::new_v4())
    .bind(orphan_id)
    .bind(h.repo_id)
    .bind(&head)
    .execute(&h.db.pool)
    .await
    .unwrap();

    let killed = ExecutionProcess::mark_running_as_killed(&h.db.pool).await.unwrap();
    assert_eq!(killed, 1);

    let orphan = ExecutionProcess::find_by_id(&h.db.pool, orphan_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orphan.status, ExecutionProcessStatus::Killed);
    assert_eq!(orphan.exit_code, None);
    assert!(orphan.completed_at.is_some());

    // Back-fill: the orphan's before-head comes from the previous
    // process's after-head
    let missing = ExecutionProcessRepoState::find_missing_before(&h.db.pool)
        .await
        .unwrap();
    assert_eq!(missing.len(), 1);
    let (state, session_id) = &missing[0];
    let previous = ExecutionProcessRepoState::previous_after_head_commit(
        &h.db.pool,
        *session_id,
        state.repo_id,
        state.execution_process_id,
    )
    .await
    .unwrap()
    .unwrap();
    ExecutionProcessRepoState::update_before_head_commit(&h.db.pool, state.id, &previous)
        .await
        .unwrap();

    let state = ExecutionProcessRepoState::find_by_process_and_repo(
        &h.db.pool,
        orphan_id,
        h.repo_id,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(state.before_head_commit.as_deref(), Some(head.as_str()));
}
