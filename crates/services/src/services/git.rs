use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::{
    BranchType, Error as GitError, IndexAddOption, Repository, ResetType, Signature, Status,
    StatusOptions, build::CheckoutBuilder,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utils::diff::{Diff, FileDiffDetails, create_unified_diff_hunk};

const FALLBACK_IDENTITY_NAME: &str = "Workhorse";
const FALLBACK_IDENTITY_EMAIL: &str = "noreply@workhorse.dev";

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid repository: {0}")]
    InvalidRepository(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("Merge conflicts: {0}")]
    MergeConflicts(String),
    #[error("Worktree has uncommitted changes: {0}")]
    WorktreeDirty(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadInfo {
    pub oid: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStatus {
    pub commits_ahead: usize,
    pub commits_behind: usize,
    pub has_uncommitted_changes: bool,
    pub target_branch_name: String,
    pub head_oid: Option<String>,
    pub last_commit_message: Option<String>,
    pub last_commit_date: Option<DateTime<Utc>>,
}

/// What to diff: the live worktree against its merge base with the target
/// branch, or a recorded commit range.
pub enum DiffTarget<'a> {
    Worktree {
        worktree_path: &'a Path,
        target_branch: &'a str,
    },
    Commits {
        repo_path: &'a Path,
        from: &'a str,
        to: &'a str,
    },
}

/// git2-backed plumbing for task execution workflows.
#[derive(Clone, Default)]
pub struct GitService;

impl GitService {
    pub fn new() -> Self {
        Self {}
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, GitError> {
        repo.signature()
            .or_else(|_| Signature::now(FALLBACK_IDENTITY_NAME, FALLBACK_IDENTITY_EMAIL))
    }

    /// Initialize a repository with a `main` branch and an empty initial
    /// commit. Used by tests and by repo registration on empty directories.
    pub fn initialize_repo_with_main_branch(&self, path: &Path) -> Result<(), GitServiceError> {
        std::fs::create_dir_all(path)?;
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts)?;
        self.create_initial_commit(&repo)?;
        Ok(())
    }

    pub fn configure_user(
        &self,
        repo_path: &Path,
        name: &str,
        email: &str,
    ) -> Result<(), GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let mut config = repo.config()?;
        config.set_str("user.name", name)?;
        config.set_str("user.email", email)?;
        Ok(())
    }

    /// Create an empty initial commit on `main`. Needed for repositories
    /// without any commits, where branch creation has nothing to point at.
    pub fn create_initial_commit(&self, repo: &Repository) -> Result<(), GitServiceError> {
        let sig = Self::signature(repo)?;
        let tree_id = {
            let mut index = repo.index()?;
            index.write_tree()?
        };
        let tree = repo.find_tree(tree_id)?;
        repo.commit(
            Some("refs/heads/main"),
            &sig,
            &sig,
            "Initial commit",
            &tree,
            &[],
        )?;
        repo.set_head("refs/heads/main")?;
        Ok(())
    }

    /// Stage everything and commit. Returns false when there was nothing to
    /// commit.
    pub fn commit(&self, path: &Path, message: &str) -> Result<bool, GitServiceError> {
        let repo = Repository::open(path)?;

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let head_commit = repo.head()?.peel_to_commit()?;
        if head_commit.tree_id() == tree_id {
            return Ok(false);
        }

        let sig = Self::signature(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head_commit])?;
        Ok(true)
    }

    pub fn get_head_info(&self, path: &Path) -> Result<HeadInfo, GitServiceError> {
        let repo = Repository::open(path)?;
        let head = repo.head()?;
        let oid = head
            .peel_to_commit()
            .map(|c| c.id().to_string())
            .map_err(GitServiceError::Git)?;
        let branch = head.shorthand().map(str::to_string);
        Ok(HeadInfo { oid, branch })
    }

    pub fn get_default_branch_name(&self, repo_path: &Path) -> Result<String, GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("main").to_string())
    }

    pub fn branch_exists(&self, repo_path: &Path, branch: &str) -> Result<bool, GitServiceError> {
        let repo = Repository::open(repo_path)?;
        Ok(repo.find_branch(branch, BranchType::Local).is_ok())
    }

    pub fn rename_branch(
        &self,
        repo_path: &Path,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let mut branch = repo
            .find_branch(old_name, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(old_name.to_string()))?;
        branch.rename(new_name, false)?;
        Ok(())
    }

    pub fn is_worktree_clean(&self, path: &Path) -> Result<bool, GitServiceError> {
        let repo = Repository::open(path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.iter().all(|s| s.status() == Status::CURRENT))
    }

    /// `git reset --hard <commit>` in a worktree.
    pub fn hard_reset_to(&self, worktree_path: &Path, commit_sha: &str) -> Result<(), GitServiceError> {
        let repo = Repository::open(worktree_path)?;
        let oid = git2::Oid::from_str(commit_sha)?;
        let object = repo.find_object(oid, None)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(&object, ResetType::Hard, Some(&mut checkout))?;
        Ok(())
    }

    /// Ahead/behind/dirty/last-commit of `branch` relative to
    /// `target_branch`, evaluated in the main repository.
    pub fn branch_status(
        &self,
        repo_path: &Path,
        branch: &str,
        target_branch: &str,
        worktree_path: Option<&Path>,
    ) -> Result<BranchStatus, GitServiceError> {
        let repo = Repository::open(repo_path)?;

        let branch_oid = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(branch.to_string()))?
            .get()
            .peel_to_commit()?
            .id();
        let target_oid = repo
            .find_branch(target_branch, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(target_branch.to_string()))?
            .get()
            .peel_to_commit()?
            .id();

        let (commits_ahead, commits_behind) = repo.graph_ahead_behind(branch_oid, target_oid)?;

        let head_commit = repo.find_commit(branch_oid)?;
        let last_commit_date = Utc
            .timestamp_opt(head_commit.time().seconds(), 0)
            .single();

        let has_uncommitted_changes = match worktree_path {
            Some(path) => !self.is_worktree_clean(path)?,
            None => false,
        };

        Ok(BranchStatus {
            commits_ahead,
            commits_behind,
            has_uncommitted_changes,
            target_branch_name: target_branch.to_string(),
            head_oid: Some(branch_oid.to_string()),
            last_commit_message: head_commit.message().map(str::to_string),
            last_commit_date,
        })
    }

    /// Merge a workspace branch into its target branch with a true merge
    /// commit, updating only the target ref. Conflicts abort the merge.
    pub fn merge_branch(
        &self,
        repo_path: &Path,
        branch: &str,
        target_branch: &str,
        message: &str,
    ) -> Result<String, GitServiceError> {
        let repo = Repository::open(repo_path)?;

        let ours = repo
            .find_branch(target_branch, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(target_branch.to_string()))?
            .get()
            .peel_to_commit()?;
        let theirs = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(branch.to_string()))?
            .get()
            .peel_to_commit()?;

        let mut merged_index = repo.merge_commits(&ours, &theirs, None)?;
        if merged_index.has_conflicts() {
            let conflicted: Vec<String> = merged_index
                .conflicts()?
                .filter_map(|c| c.ok())
                .filter_map(|c| {
                    c.our
                        .or(c.their)
                        .and_then(|e| String::from_utf8(e.path).ok())
                })
                .collect();
            return Err(GitServiceError::MergeConflicts(conflicted.join(", ")));
        }

        let tree_id = merged_index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let merge_commit = repo.commit(
            Some(&format!("refs/heads/{target_branch}")),
            &sig,
            &sig,
            message,
            &tree,
            &[&ours, &theirs],
        )?;

        Ok(merge_commit.to_string())
    }

    /// Per-file diffs for streaming. Paths in `filter` (repo-relative)
    /// restrict the output when present.
    pub fn get_diffs(
        &self,
        target: DiffTarget<'_>,
        filter: Option<&[&str]>,
    ) -> Result<Vec<Diff>, GitServiceError> {
        match target {
            DiffTarget::Worktree {
                worktree_path,
                target_branch,
            } => self.worktree_diffs(worktree_path, target_branch, filter),
            DiffTarget::Commits {
                repo_path,
                from,
                to,
            } => self.commit_diffs(repo_path, from, to, filter),
        }
    }

    fn worktree_diffs(
        &self,
        worktree_path: &Path,
        target_branch: &str,
        filter: Option<&[&str]>,
    ) -> Result<Vec<Diff>, GitServiceError> {
        let repo = Repository::open(worktree_path)?;

        let head_oid = repo.head()?.peel_to_commit()?.id();
        let target_oid = repo
            .find_branch(target_branch, BranchType::Local)
            .or_else(|_| repo.find_branch(&format!("origin/{target_branch}"), BranchType::Remote))
            .map_err(|_| GitServiceError::BranchNotFound(target_branch.to_string()))?
            .get()
            .peel_to_commit()?
            .id();

        // Diff against the merge base so commits on the target after the
        // fork point don't show up as reverse changes.
        let base_oid = repo.merge_base(head_oid, target_oid).unwrap_or(target_oid);
        let base_tree = repo.find_commit(base_oid)?.tree()?;

        let mut opts = git2::DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        if let Some(paths) = filter {
            for p in paths {
                opts.pathspec(p);
            }
        }

        let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;
        self.collect_file_diffs(&repo, &diff, Some(worktree_path))
    }

    fn commit_diffs(
        &self,
        repo_path: &Path,
        from: &str,
        to: &str,
        filter: Option<&[&str]>,
    ) -> Result<Vec<Diff>, GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let from_tree = repo
            .find_commit(git2::Oid::from_str(from)?)?
            .tree()?;
        let to_tree = repo.find_commit(git2::Oid::from_str(to)?)?.tree()?;

        let mut opts = git2::DiffOptions::new();
        if let Some(paths) = filter {
            for p in paths {
                opts.pathspec(p);
            }
        }

        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut opts))?;
        self.collect_file_diffs(&repo, &diff, None)
    }

    fn collect_file_diffs(
        &self,
        repo: &Repository,
        diff: &git2::Diff<'_>,
        worktree_path: Option<&Path>,
    ) -> Result<Vec<Diff>, GitServiceError> {
        let mut out = Vec::new();

        for delta in diff.deltas() {
            let old_path = delta.old_file().path().map(Path::to_path_buf);
            let new_path = delta.new_file().path().map(Path::to_path_buf);

            let old_content = old_path
                .as_deref()
                .and_then(|_| self.blob_content(repo, delta.old_file().id()));
            let new_content = match worktree_path {
                // For worktree diffs the new side is the file on disk
                Some(root) => new_path
                    .as_deref()
                    .and_then(|p| std::fs::read_to_string(root.join(p)).ok()),
                None => new_path
                    .as_deref()
                    .and_then(|_| self.blob_content(repo, delta.new_file().id())),
            };

            let hunks = match (&old_content, &new_content) {
                (Some(old), Some(new)) if old == new => continue,
                (Some(old), Some(new)) => vec![create_unified_diff_hunk(old, new)],
                (Some(old), None) => vec![create_unified_diff_hunk(old, "")],
                (None, Some(new)) => vec![create_unified_diff_hunk("", new)],
                // Binary or unreadable on both sides: record the path change
                (None, None) => Vec::new(),
            };

            out.push(Diff {
                old_file: old_path.map(|p| FileDiffDetails {
                    file_name: Some(p.to_string_lossy().replace('\\', "/")),
                    content: old_content.clone(),
                }),
                new_file: new_path.map(|p| FileDiffDetails {
                    file_name: Some(p.to_string_lossy().replace('\\', "/")),
                    content: new_content.clone(),
                }),
                hunks,
            });
        }

        Ok(out)
    }

    fn blob_content(&self, repo: &Repository, id: git2::Oid) -> Option<String> {
        if id.is_zero() {
            return None;
        }
        let blob = repo.find_blob(id).ok()?;
        if blob.is_binary() {
            return None;
        }
        String::from_utf8(blob.content().to_vec()).ok()
    }

    /// Create a local branch pointing at `base_branch`'s head.
    pub fn create_branch(
        &self,
        repo_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), GitServiceError> {
        let repo = Repository::open(repo_path)?;
        let base_commit = repo
            .find_branch(base_branch, BranchType::Local)
            .map_err(|_| GitServiceError::BranchNotFound(base_branch.to_string()))?
            .get()
            .peel_to_commit()?;
        repo.branch(branch, &base_commit, false)?;
        Ok(())
    }

    pub fn checkout_branch(&self, repo_path: &Path, branch: &str) -> Result<(), GitServiceError> {
        let repo = Repository::open(repo_path)?;
        repo.set_head(&format!("refs/heads/{branch}"))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo(td: &TempDir) -> PathBuf {
        let path = td.path().join("repo");
        let s = GitService::new();
        s.initialize_repo_with_main_branch(&path).unwrap();
        s.configure_user(&path, "Test User", "test@example.com")
            .unwrap();
        path
    }

    #[test]
    fn commit_reports_whether_changes_were_made() {
        let td = TempDir::new().unwrap();
        let repo_path = init_repo(&td);
        let s = GitService::new();

        std::fs::write(repo_path.join("a.txt"), "hello\n").unwrap();
        assert!(s.commit(&repo_path, "add a").unwrap());
        // Second commit with no changes is a no-op
        assert!(!s.commit(&repo_path, "empty").unwrap());
    }

    #[test]
    fn branch_status_counts_ahead() {
        let td = TempDir::new().unwrap();
        let repo_path = init_repo(&td);
        let s = GitService::new();

        s.create_branch(&repo_path, "feature", "main").unwrap();
        s.checkout_branch(&repo_path, "feature").unwrap();
        std::fs::write(repo_path.join("f.txt"), "x\n").unwrap();
        s.commit(&repo_path, "feature work").unwrap();

        let status = s.branch_status(&repo_path, "feature", "main", None).unwrap();
        assert_eq!(status.commits_ahead, 1);
        assert_eq!(status.commits_behind, 0);
    }

    #[test]
    fn merge_creates_commit_on_target() {
        let td = TempDir::new().unwrap();
        let repo_path = init_repo(&td);
        let s = GitService::new();

        s.create_branch(&repo_path, "feature", "main").unwrap();
        s.checkout_branch(&repo_path, "feature").unwrap();
        std::fs::write(repo_path.join("f.txt"), "x\n").unwrap();
        s.commit(&repo_path, "feature work").unwrap();

        let merge_commit = s
            .merge_branch(&repo_path, "feature", "main", "merge feature")
            .unwrap();
        assert!(!merge_commit.is_empty());

        let status = s.branch_status(&repo_path, "feature", "main", None).unwrap();
        assert_eq!(status.commits_ahead, 0);
    }

    #[test]
    fn hard_reset_moves_head_back() {
        let td = TempDir::new().unwrap();
        let repo_path = init_repo(&td);
        let s = GitService::new();

        let first = s.get_head_info(&repo_path).unwrap().oid;
        std::fs::write(repo_path.join("b.txt"), "y\n").unwrap();
        s.commit(&repo_path, "second").unwrap();
        assert_ne!(s.get_head_info(&repo_path).unwrap().oid, first);

        s.hard_reset_to(&repo_path, &first).unwrap();
        assert_eq!(s.get_head_info(&repo_path).unwrap().oid, first);
        assert!(!repo_path.join("b.txt").exists());
    }
}
