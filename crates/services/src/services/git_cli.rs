//! Shell `git` is used for the operations where the CLI's working-tree
//! protections and network stack beat libgit2: push, rebase, sparse-checkout
//! reapply, and `--git-common-dir` inference. libgit2 stays the engine for
//! read-only graph queries, worktree registration, and commits.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use utils::shell::resolve_executable_path;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git authentication failed: {0}")]
    AuthFailed(String),
    #[error("push rejected: {0}")]
    PushRejected(String),
    #[error("rebase in progress in this worktree")]
    RebaseInProgress,
    #[error("git command failed: {0}")]
    CommandFailed(String),
}

impl GitCliError {
    /// Stable code surfaced alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            GitCliError::NotAvailable => "git_unavailable",
            GitCliError::AuthFailed(_) => "auth_failed",
            GitCliError::PushRejected(_) => "push_rejected",
            GitCliError::RebaseInProgress => "rebase_in_progress",
            GitCliError::CommandFailed(_) => "command_failed",
        }
    }
}

fn classify(stderr: &str) -> GitCliError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied (publickey")
    {
        GitCliError::AuthFailed(stderr.to_string())
    } else if lower.contains("[rejected]") || lower.contains("non-fast-forward") {
        GitCliError::PushRejected(stderr.to_string())
    } else {
        GitCliError::CommandFailed(stderr.to_string())
    }
}

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let git = resolve_executable_path("git").ok_or(GitCliError::NotAvailable)?;
        let mut cmd = Command::new(&git);
        cmd.arg("-C").arg(repo_path);
        for a in args {
            cmd.arg(a);
        }
        let out = cmd
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(classify(&stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    /// Resolve the main repository directory a worktree belongs to via
    /// `git rev-parse --git-common-dir`. Returns the working directory, not
    /// the `.git` directory.
    pub fn git_common_dir(&self, worktree_path: &Path) -> Option<PathBuf> {
        let out = self
            .git(worktree_path, ["rev-parse", "--git-common-dir"])
            .ok()?;
        let git_dir = PathBuf::from(out.trim());
        let git_dir = if git_dir.is_absolute() {
            git_dir
        } else {
            worktree_path.join(git_dir)
        };
        if git_dir.file_name() == Some(OsStr::new(".git")) {
            git_dir.parent().map(Path::to_path_buf)
        } else {
            Some(git_dir)
        }
    }

    /// Reapply sparse-checkout in a fresh worktree so materialization
    /// matches the repo configuration. Non-fatal when not configured.
    pub fn sparse_checkout_reapply(&self, worktree_path: &Path) {
        if let Err(e) = self.git(worktree_path, ["sparse-checkout", "reapply"]) {
            tracing::debug!(
                "sparse-checkout reapply skipped for {}: {}",
                worktree_path.display(),
                e
            );
        }
    }

    /// Push a branch to origin. `force` uses `--force-with-lease`.
    pub fn push(
        &self,
        repo_path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["push".into(), "origin".into()];
        if force {
            args.push("--force-with-lease".into());
        }
        args.push(OsString::from(format!("{branch}:{branch}")));
        self.git(repo_path, args)?;
        Ok(())
    }

    /// `git rebase <onto>` on the branch checked out in `worktree_path`.
    pub fn rebase_onto(&self, worktree_path: &Path, onto: &str) -> Result<(), GitCliError> {
        if self.is_rebase_in_progress(worktree_path) {
            return Err(GitCliError::RebaseInProgress);
        }
        self.git(worktree_path, ["rebase", onto])?;
        Ok(())
    }

    pub fn rebase_continue(&self, worktree_path: &Path) -> Result<(), GitCliError> {
        self.git(worktree_path, ["-c", "core.editor=true", "rebase", "--continue"])?;
        Ok(())
    }

    pub fn rebase_abort(&self, worktree_path: &Path) -> Result<(), GitCliError> {
        self.git(worktree_path, ["rebase", "--abort"])?;
        Ok(())
    }

    pub fn is_rebase_in_progress(&self, worktree_path: &Path) -> bool {
        self.git(worktree_path, ["rev-parse", "--verify", "REBASE_HEAD"])
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_stable_codes() {
        assert_eq!(classify("fatal: Authentication failed for url").code(), "auth_failed");
        assert_eq!(
            classify("! [rejected] main -> main (non-fast-forward)").code(),
            "push_rejected"
        );
        assert_eq!(classify("fatal: not a git repository").code(), "command_failed");
    }
}
