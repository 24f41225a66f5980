use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::worktree_manager::{WorktreeError, WorktreeManager};

pub const WORKTREE_CLEANUP_DISABLE_ENV: &str = "WORKTREE_CLEANUP_DISABLE";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Workspace must include at least one repository")]
    NoRepos,
    #[error("Workspace creation failed on repo '{repo_name}': {source}")]
    PartialCreation {
        repo_name: String,
        #[source]
        source: WorktreeError,
    },
}

/// One repo's slot in a workspace: where its main repository lives, which
/// branch the workspace forked from, and the worktree directory name.
#[derive(Debug, Clone)]
pub struct WorkspaceRepoSpec {
    pub repo_path: PathBuf,
    pub repo_name: String,
    pub target_branch: String,
}

impl WorkspaceRepoSpec {
    pub fn worktree_path(&self, workspace_dir: &Path) -> PathBuf {
        workspace_dir.join(&self.repo_name)
    }
}

/// Composes the worktree manager across every repo of a workspace.
pub struct WorkspaceManager;

impl WorkspaceManager {
    /// Materialize a workspace: one worktree per repo, all on the same new
    /// task branch. On the first failure every already-created worktree is
    /// rolled back and the workspace directory removed if empty.
    pub async fn create(
        workspace_dir: &Path,
        repos: &[WorkspaceRepoSpec],
        branch_name: &str,
    ) -> Result<(), WorkspaceError> {
        if repos.is_empty() {
            return Err(WorkspaceError::NoRepos);
        }

        std::fs::create_dir_all(workspace_dir)?;

        let mut created: Vec<&WorkspaceRepoSpec> = Vec::new();
        for spec in repos {
            let worktree_path = spec.worktree_path(workspace_dir);
            match WorktreeManager::create_worktree(
                &spec.repo_path,
                branch_name,
                &worktree_path,
                Some(&spec.target_branch),
                true,
            )
            .await
            {
                Ok(()) => created.push(spec),
                Err(source) => {
                    Self::rollback(workspace_dir, &created).await;
                    return Err(WorkspaceError::PartialCreation {
                        repo_name: spec.repo_name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    async fn rollback(workspace_dir: &Path, created: &[&WorkspaceRepoSpec]) {
        for spec in created {
            let worktree_path = spec.worktree_path(workspace_dir);
            if let Err(e) =
                WorktreeManager::cleanup_worktree(&worktree_path, Some(&spec.repo_path)).await
            {
                warn!(
                    "Rollback of worktree {} failed: {e}",
                    worktree_path.display()
                );
            }
        }
        // Remove the container directory only when nothing else lives there
        match std::fs::read_dir(workspace_dir) {
            Ok(mut entries) => {
                if entries.next().is_none()
                    && let Err(e) = std::fs::remove_dir(workspace_dir)
                {
                    warn!(
                        "Failed to remove empty workspace dir {}: {e}",
                        workspace_dir.display()
                    );
                }
            }
            Err(_) => {}
        }
    }

    /// Cold-start guarantee that every repo worktree exists. A
    /// single-repo workspace in the legacy layout (the workspace directory
    /// itself being the worktree) is migrated first.
    pub async fn ensure(
        workspace_dir: &Path,
        repos: &[WorkspaceRepoSpec],
        branch_name: &str,
    ) -> Result<(), WorkspaceError> {
        if repos.is_empty() {
            return Err(WorkspaceError::NoRepos);
        }

        if repos.len() == 1 {
            let migrated = WorktreeManager::migrate_legacy_layout(
                &repos[0].repo_path,
                workspace_dir,
                &repos[0].repo_name,
            )
            .await?;
            if migrated {
                info!(
                    "Migrated legacy workspace layout at {}",
                    workspace_dir.display()
                );
            }
        }

        for spec in repos {
            WorktreeManager::ensure_worktree_exists(
                &spec.repo_path,
                branch_name,
                &spec.worktree_path(workspace_dir),
            )
            .await?;
        }
        Ok(())
    }

    /// Tear a workspace down: every worktree, then the container directory.
    pub async fn cleanup(
        workspace_dir: &Path,
        repos: &[WorkspaceRepoSpec],
    ) -> Result<(), WorkspaceError> {
        for spec in repos {
            let worktree_path = spec.worktree_path(workspace_dir);
            WorktreeManager::cleanup_worktree(&worktree_path, Some(&spec.repo_path))
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        "Failed to clean up worktree {}: {e}",
                        worktree_path.display()
                    );
                });
        }
        if workspace_dir.exists() {
            std::fs::remove_dir_all(workspace_dir)?;
        }
        Ok(())
    }

    /// Remove first-level entries of the workspace base directory that no
    /// live workspace claims as its container. Each child of a suspect
    /// entry is treated as a worktree and force-cleaned first.
    pub async fn orphan_sweep(base_dir: &Path, known_container_refs: &HashSet<String>) {
        if std::env::var(WORKTREE_CLEANUP_DISABLE_ENV).is_ok() {
            debug!("Orphan sweep disabled via {WORKTREE_CLEANUP_DISABLE_ENV}");
            return;
        }
        if !base_dir.exists() {
            debug!(
                "Workspace base directory {} does not exist, skipping orphan sweep",
                base_dir.display()
            );
            return;
        }

        let entries = match std::fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read workspace base {}: {e}", base_dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let path_str = path.to_string_lossy().to_string();
            if known_container_refs.contains(&path_str) {
                continue;
            }

            info!("Found orphaned workspace directory: {path_str}");

            if let Ok(children) = std::fs::read_dir(&path) {
                for child in children.flatten() {
                    let child_path = child.path();
                    if !child_path.is_dir() {
                        continue;
                    }
                    if let Err(e) = WorktreeManager::cleanup_worktree(&child_path, None).await {
                        warn!(
                            "Failed to clean suspected orphan worktree {}: {e}",
                            child_path.display()
                        );
                    }
                }
            }

            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove orphaned workspace {path_str}: {e}");
            } else {
                info!("Removed orphaned workspace {path_str}");
            }
        }
    }
}
