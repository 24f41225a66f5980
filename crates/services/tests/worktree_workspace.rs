use std::{collections::HashSet, fs, path::PathBuf};

use services::services::{
    git::GitService,
    workspace_manager::{WorkspaceError, WorkspaceManager, WorkspaceRepoSpec},
    worktree_manager::WorktreeManager,
};
use tempfile::TempDir;

fn init_repo(root: &TempDir, name: &str) -> PathBuf {
    let path = root.path().join(name);
    let s = GitService::new();
    s.initialize_repo_with_main_branch(&path).unwrap();
    s.configure_user(&path, "Test User", "test@example.com")
        .unwrap();
    fs::write(path.join("README.md"), format!("# {name}\n")).unwrap();
    s.commit(&path, "seed").unwrap();
    path
}

fn spec(repo_path: &PathBuf, name: &str) -> WorkspaceRepoSpec {
    WorkspaceRepoSpec {
        repo_path: repo_path.clone(),
        repo_name: name.to_string(),
        target_branch: "main".to_string(),
    }
}

#[tokio::test]
async fn create_materializes_one_worktree_per_repo() {
    let td = TempDir::new().unwrap();
    let repo_a = init_repo(&td, "alpha");
    let repo_b = init_repo(&td, "beta");
    let workspace_dir = td.path().join("ws").join("attempt-1");

    let specs = vec![spec(&repo_a, "alpha"), spec(&repo_b, "beta")];
    WorkspaceManager::create(&workspace_dir, &specs, "ws/test-1")
        .await
        .unwrap();

    assert!(workspace_dir.join("alpha").join("README.md").exists());
    assert!(workspace_dir.join("beta").join("README.md").exists());

    // The task branch exists in both source repos
    let git = GitService::new();
    assert!(git.branch_exists(&repo_a, "ws/test-1").unwrap());
    assert!(git.branch_exists(&repo_b, "ws/test-1").unwrap());
}

#[tokio::test]
async fn create_with_empty_repo_list_fails() {
    let td = TempDir::new().unwrap();
    let workspace_dir = td.path().join("ws").join("empty");

    let err = WorkspaceManager::create(&workspace_dir, &[], "ws/none")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::NoRepos));
    assert!(!workspace_dir.exists());
}

#[tokio::test]
async fn partial_creation_rolls_back_earlier_worktrees() {
    let td = TempDir::new().unwrap();
    let repo_a = init_repo(&td, "good");
    // Not a git repository at all
    let bogus = td.path().join("bogus");
    fs::create_dir_all(&bogus).unwrap();

    let workspace_dir = td.path().join("ws").join("attempt-2");
    let specs = vec![spec(&repo_a, "good"), spec(&bogus, "bogus")];

    let err = WorkspaceManager::create(&workspace_dir, &specs, "ws/test-2")
        .await
        .unwrap_err();

    match err {
        WorkspaceError::PartialCreation { repo_name, .. } => assert_eq!(repo_name, "bogus"),
        other => panic!("expected PartialCreation, got {other:?}"),
    }

    // No filesystem remnants
    assert!(!workspace_dir.join("good").exists());
    assert!(!workspace_dir.exists());
}

#[tokio::test]
async fn ensure_recreates_missing_worktree() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td, "solo");
    let workspace_dir = td.path().join("ws").join("attempt-3");
    let specs = vec![spec(&repo, "solo")];

    WorkspaceManager::create(&workspace_dir, &specs, "ws/test-3")
        .await
        .unwrap();

    // Simulate external deletion of the worktree
    fs::remove_dir_all(workspace_dir.join("solo")).unwrap();

    WorkspaceManager::ensure(&workspace_dir, &specs, "ws/test-3")
        .await
        .unwrap();
    assert!(workspace_dir.join("solo").join("README.md").exists());
}

#[tokio::test]
async fn cleanup_removes_worktrees_and_container() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td, "gone");
    let workspace_dir = td.path().join("ws").join("attempt-4");
    let specs = vec![spec(&repo, "gone")];

    WorkspaceManager::create(&workspace_dir, &specs, "ws/test-4")
        .await
        .unwrap();
    WorkspaceManager::cleanup(&workspace_dir, &specs).await.unwrap();

    assert!(!workspace_dir.exists());

    // A new workspace on the same branch can be created again afterwards
    WorkspaceManager::create(&workspace_dir, &specs, "ws/test-4b")
        .await
        .unwrap();
    assert!(workspace_dir.join("gone").exists());
}

#[tokio::test]
async fn orphan_sweep_spares_known_container_refs() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td, "kept");
    let base = td.path().join("base");

    let known_dir = base.join("known");
    let orphan_dir = base.join("orphan");
    WorkspaceManager::create(&known_dir, &[spec(&repo, "kept")], "ws/known")
        .await
        .unwrap();
    fs::create_dir_all(orphan_dir.join("stale-worktree")).unwrap();

    let known: HashSet<String> = [known_dir.to_string_lossy().to_string()].into();
    WorkspaceManager::orphan_sweep(&base, &known).await;

    assert!(known_dir.exists(), "sweep must never remove a live container");
    assert!(!orphan_dir.exists());
}

#[tokio::test]
async fn legacy_single_worktree_layout_is_migrated() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td, "legacy");
    let workspace_dir = td.path().join("ws").join("attempt-5");

    // Old layout: the workspace directory itself is the worktree
    WorktreeManager::create_worktree(&repo, "ws/legacy", &workspace_dir, Some("main"), true)
        .await
        .unwrap();
    assert!(workspace_dir.join(".git").is_file());

    let specs = vec![spec(&repo, "legacy")];
    WorkspaceManager::ensure(&workspace_dir, &specs, "ws/legacy")
        .await
        .unwrap();

    assert!(workspace_dir.join("legacy").join("README.md").exists());
    assert!(!workspace_dir.join(".git").exists());
}

#[tokio::test]
async fn worktree_cleanup_infers_repo_from_common_dir() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td, "inferred");
    let worktree_path = td.path().join("wt").join("inferred-wt");

    WorktreeManager::create_worktree(&repo, "ws/inferred", &worktree_path, Some("main"), true)
        .await
        .unwrap();

    // No repo path passed; cleanup must find it through git-common-dir
    WorktreeManager::cleanup_worktree(&worktree_path, None)
        .await
        .unwrap();
    assert!(!worktree_path.exists());

    // No registration left behind in the repo's metadata
    let leftover = fs::read_dir(repo.join(".git/worktrees"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
