pub mod approvals;
pub mod config;
pub mod container;
pub mod events;
pub mod filesystem_watcher;
pub mod git;
pub mod git_cli;
pub mod github;
pub mod notification;
pub mod workspace_manager;
pub mod worktree_manager;
