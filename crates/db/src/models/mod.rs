pub mod coding_agent_turn;
pub mod execution_process;
pub mod execution_process_logs;
pub mod execution_process_repo_state;
pub mod image;
pub mod merge;
pub mod project;
pub mod queued_message;
pub mod repo;
pub mod scratch;
pub mod session;
pub mod tag;
pub mod task;
pub mod workspace;
pub mod workspace_repo;
