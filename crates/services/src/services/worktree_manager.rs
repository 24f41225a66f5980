use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use git2::{BranchType, Error as GitError, Repository, WorktreeAddOptions};
use thiserror::Error;
use tracing::{debug, info};

use super::{
    git::{GitService, GitServiceError},
    git_cli::GitCli,
};

// Global synchronization for worktree operations: all work on a given
// worktree path is linearized through one async mutex per path.
lazy_static::lazy_static! {
    static ref WORKTREE_LOCKS: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
        Arc::new(Mutex::new(HashMap::new()));
}

fn lock_for(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = path.to_string_lossy().to_string();
    let mut locks = WORKTREE_LOCKS.lock().unwrap();
    locks
        .entry(key)
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    GitService(#[from] GitServiceError),
    #[error("Task join error: {0}")]
    TaskJoin(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Repository error: {0}")]
    Repository(String),
}

pub struct WorktreeManager;

impl WorktreeManager {
    /// Create a worktree, optionally creating `branch_name` from
    /// `base_branch` first. Partial state left by a failed attempt is
    /// cleaned up before retrying and on error.
    pub async fn create_worktree(
        repo_path: &Path,
        branch_name: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
        create_branch: bool,
    ) -> Result<(), WorktreeError> {
        if create_branch {
            let repo_path_owned = repo_path.to_path_buf();
            let branch_name_owned = branch_name.to_string();
            let base_branch_owned = base_branch.map(str::to_string);

            tokio::task::spawn_blocking(move || {
                let repo = Repository::open(&repo_path_owned)?;

                let base_reference = if let Some(base_branch) = base_branch_owned.as_deref() {
                    let branch = repo.find_branch(base_branch, BranchType::Local)?;
                    branch.into_reference()
                } else {
                    match repo.head() {
                        Ok(head_ref) => head_ref,
                        Err(e)
                            if e.class() == git2::ErrorClass::Reference
                                && e.code() == git2::ErrorCode::UnbornBranch =>
                        {
                            // Repository has no commits yet
                            GitService::new().create_initial_commit(&repo).map_err(|_| {
                                GitError::from_str("Failed to create initial commit")
                            })?;
                            repo.find_reference("refs/heads/main")?
                        }
                        Err(e) => return Err(e),
                    }
                };

                repo.branch(&branch_name_owned, &base_reference.peel_to_commit()?, false)?;
                Ok::<(), GitError>(())
            })
            .await
            .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))??;
        }

        Self::ensure_worktree_exists(repo_path, branch_name, worktree_path).await
    }

    /// Ensure a worktree exists with consistent filesystem state and git
    /// metadata, recreating it from scratch when either is missing.
    pub async fn ensure_worktree_exists(
        repo_path: &Path,
        branch_name: &str,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        let lock = lock_for(worktree_path);
        let _guard = lock.lock().await;

        if Self::is_worktree_properly_set_up(repo_path, worktree_path).await? {
            debug!(
                "Worktree already properly set up at {}",
                worktree_path.display()
            );
            return Ok(());
        }

        info!("Worktree needs recreation at {}", worktree_path.display());
        Self::recreate_worktree_internal(repo_path, branch_name, worktree_path).await
    }

    async fn recreate_worktree_internal(
        repo_path: &Path,
        branch_name: &str,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        info!(
            "Creating worktree {} at {}",
            branch_name,
            worktree_path.display()
        );

        Self::comprehensive_cleanup_async(repo_path, worktree_path).await?;

        if let Some(parent) = worktree_path.parent() {
            let parent = parent.to_path_buf();
            tokio::task::spawn_blocking(move || std::fs::create_dir_all(&parent))
                .await
                .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))??;
        }

        let repo_path_owned = repo_path.to_path_buf();
        let branch_name_owned = branch_name.to_string();
        let worktree_path_owned = worktree_path.to_path_buf();
        let registration_name = Self::registration_name(worktree_path)?;

        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            let repo = Repository::open(&repo_path_owned)?;

            let branch_ref = repo
                .find_branch(&branch_name_owned, BranchType::Local)?
                .into_reference();

            let mut worktree_opts = WorktreeAddOptions::new();
            worktree_opts.reference(Some(&branch_ref));

            let add = |opts: &WorktreeAddOptions| {
                repo.worktree(&registration_name, &worktree_path_owned, Some(opts))
            };

            match add(&worktree_opts) {
                Ok(_) => {}
                Err(e) if e.code() == git2::ErrorCode::Exists => {
                    // Stale metadata left by an interrupted removal
                    debug!("Worktree metadata exists, force cleaning: {e}");
                    Self::force_cleanup_metadata(&repo_path_owned, &registration_name)?;
                    add(&worktree_opts)?;
                }
                Err(e) => return Err(WorktreeError::Git(e)),
            }

            if !worktree_path_owned.exists() {
                return Err(WorktreeError::Repository(format!(
                    "Worktree creation reported success but {} does not exist",
                    worktree_path_owned.display()
                )));
            }

            // Reapply sparse-checkout so the new worktree matches the repo
            // configuration; not configured is fine.
            GitCli::new().sparse_checkout_reapply(&worktree_path_owned);

            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))?
    }

    /// Name under which a worktree is registered in git metadata. The
    /// container directory component is included because several
    /// workspaces of the same repo share the repo-name leaf.
    fn registration_name(worktree_path: &Path) -> Result<String, WorktreeError> {
        let leaf = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WorktreeError::InvalidPath("Invalid worktree path".to_string()))?;
        Ok(match worktree_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            Some(parent) => format!("{parent}-{leaf}"),
            None => leaf.to_string(),
        })
    }

    /// Find the metadata registration owning `worktree_path` by walking the
    /// repository's `worktrees` directory and matching each entry's
    /// `gitdir` pointer.
    fn find_registration_by_path(git_repo_path: &Path, worktree_path: &Path) -> Option<String> {
        let worktrees_dir = git_repo_path.join(".git").join("worktrees");
        let entries = std::fs::read_dir(&worktrees_dir).ok()?;

        for entry in entries.flatten() {
            let gitdir_file = entry.path().join("gitdir");
            let Ok(content) = std::fs::read_to_string(&gitdir_file) else {
                continue;
            };
            // gitdir points at "<worktree>/.git"
            let registered = PathBuf::from(content.trim());
            if registered.parent() == Some(worktree_path) {
                return entry.file_name().to_str().map(str::to_string);
            }
        }
        None
    }

    /// Filesystem path must exist and git metadata must have a
    /// registration pointing back at it; anything else counts as
    /// improperly set up.
    async fn is_worktree_properly_set_up(
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<bool, WorktreeError> {
        let repo_path = repo_path.to_path_buf();
        let worktree_path = worktree_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<bool, WorktreeError> {
            if !worktree_path.exists() {
                return Ok(false);
            }
            Ok(Self::find_registration_by_path(&repo_path, &worktree_path).is_some())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))?
    }

    fn try_remove_registration(repo: &Repository, registration_name: &str) -> Result<(), GitError> {
        let worktrees = repo.worktrees()?;
        for name in worktrees.iter().flatten() {
            if name == registration_name {
                let worktree = repo.find_worktree(name)?;
                let mut prune_opts = git2::WorktreePruneOptions::new();
                prune_opts.valid(true).working_tree(false);
                worktree.prune(Some(&mut prune_opts))?;
                debug!("Removed worktree registration: {name}");
                return Ok(());
            }
        }
        Ok(())
    }

    fn force_cleanup_metadata(
        git_repo_path: &Path,
        registration_name: &str,
    ) -> Result<(), std::io::Error> {
        let metadata_path = git_repo_path
            .join(".git")
            .join("worktrees")
            .join(registration_name);
        if metadata_path.exists() {
            debug!("Force removing worktree metadata: {}", metadata_path.display());
            std::fs::remove_dir_all(&metadata_path)?;
        }
        Ok(())
    }

    fn comprehensive_cleanup(
        repo: &Repository,
        git_repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        let registration_name = Self::find_registration_by_path(git_repo_path, worktree_path)
            .or_else(|| Self::registration_name(worktree_path).ok());

        if let Some(name) = registration_name {
            if let Err(e) = Self::try_remove_registration(repo, &name) {
                debug!("Worktree registration removal failed (non-fatal): {e}");
            }
            if let Err(e) = Self::force_cleanup_metadata(git_repo_path, &name) {
                debug!("Metadata cleanup failed (non-fatal): {e}");
            }
        }
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        Ok(())
    }

    async fn comprehensive_cleanup_async(
        git_repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<(), WorktreeError> {
        let git_repo_path = git_repo_path.to_path_buf();
        let worktree_path_owned = worktree_path.to_path_buf();

        let repo_result = tokio::task::spawn_blocking({
            let git_repo_path = git_repo_path.clone();
            move || Repository::open(&git_repo_path)
        })
        .await;

        match repo_result {
            Ok(Ok(repo)) => tokio::task::spawn_blocking(move || {
                Self::comprehensive_cleanup(&repo, &git_repo_path, &worktree_path_owned)
            })
            .await
            .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))?,
            Ok(Err(e)) => {
                // Repository is gone (deleted project); remove the
                // directory without touching git metadata.
                debug!(
                    "Failed to open repository at {}: {e}. Removing worktree directory only",
                    git_repo_path.display()
                );
                Self::simple_cleanup(&worktree_path_owned).await
            }
            Err(e) => Err(WorktreeError::TaskJoin(format!("{e}"))),
        }
    }

    /// Remove a worktree: git registration, metadata directory, and the
    /// filesystem path. When `git_repo_path` is unknown it is inferred from
    /// the worktree's git-common-dir; when inference fails only the
    /// directory is removed.
    pub async fn cleanup_worktree(
        worktree_path: &Path,
        git_repo_path: Option<&Path>,
    ) -> Result<(), WorktreeError> {
        let lock = lock_for(worktree_path);
        let _guard = lock.lock().await;

        let resolved_repo_path = match git_repo_path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::infer_git_repo_path(worktree_path).await,
        };

        match resolved_repo_path {
            Some(repo_path) => {
                Self::comprehensive_cleanup_async(&repo_path, worktree_path).await
            }
            None => {
                debug!(
                    "Cannot determine git repo for worktree {}, removing directory only",
                    worktree_path.display()
                );
                Self::simple_cleanup(worktree_path).await
            }
        }
    }

    async fn infer_git_repo_path(worktree_path: &Path) -> Option<PathBuf> {
        let worktree_path = worktree_path.to_path_buf();
        tokio::task::spawn_blocking(move || GitCli::new().git_common_dir(&worktree_path))
            .await
            .ok()
            .flatten()
    }

    async fn simple_cleanup(worktree_path: &Path) -> Result<(), WorktreeError> {
        let worktree_path = worktree_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            if worktree_path.exists() {
                std::fs::remove_dir_all(&worktree_path)?;
                info!("Removed worktree directory: {}", worktree_path.display());
            }
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))?
    }

    /// Relocate a worktree on disk and repair its git metadata linkage.
    pub async fn move_worktree(
        repo_path: &Path,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<(), WorktreeError> {
        let lock = lock_for(old_path);
        let _guard = lock.lock().await;

        let repo_path = repo_path.to_path_buf();
        let old_path = old_path.to_path_buf();
        let new_path = new_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            if !old_path.exists() {
                return Err(WorktreeError::InvalidPath(format!(
                    "Worktree to move does not exist: {}",
                    old_path.display()
                )));
            }

            let registration_name = Self::find_registration_by_path(&repo_path, &old_path);

            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&old_path, &new_path)?;

            // Repoint the metadata's gitdir file and the worktree's own
            // .git file at each other.
            if let Some(name) = registration_name {
                let gitdir_file = repo_path
                    .join(".git")
                    .join("worktrees")
                    .join(&name)
                    .join("gitdir");
                if gitdir_file.exists() {
                    std::fs::write(
                        &gitdir_file,
                        format!("{}\n", new_path.join(".git").to_string_lossy()),
                    )?;
                }
            }
            let worktree_git_file = new_path.join(".git");
            if worktree_git_file.is_file() {
                let content = std::fs::read_to_string(&worktree_git_file)?;
                let repointed = content.replace(
                    &old_path.to_string_lossy().to_string(),
                    &new_path.to_string_lossy(),
                );
                std::fs::write(&worktree_git_file, repointed)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(format!("{e}")))?
    }

    /// Detect the old single-worktree layout where the workspace directory
    /// itself is the worktree, and relocate it to
    /// `workspace_dir/<repo_name>` through a temporary sibling name.
    pub async fn migrate_legacy_layout(
        repo_path: &Path,
        workspace_dir: &Path,
        repo_name: &str,
    ) -> Result<bool, WorktreeError> {
        let is_legacy = workspace_dir.join(".git").is_file();
        if !is_legacy {
            return Ok(false);
        }

        info!(
            "Migrating legacy workspace layout at {}",
            workspace_dir.display()
        );

        let temp_path = workspace_dir.with_extension("migrating");
        Self::move_worktree(repo_path, workspace_dir, &temp_path).await?;
        std::fs::create_dir_all(workspace_dir)?;
        Self::move_worktree(repo_path, &temp_path, &workspace_dir.join(repo_name)).await?;

        Ok(true)
    }
}
