use db::models::execution_process::ExecutionContext;

use super::config::NotificationConfig;

pub struct NotificationService;

impl NotificationService {
    /// Desktop notification when a workspace's execution chain halts and
    /// the task moves to review.
    pub async fn notify_execution_halted(config: NotificationConfig, ctx: &ExecutionContext) {
        if !config.enabled {
            return;
        }

        let title = "Task ready for review";
        let body = format!(
            "'{}' finished (exit code {})",
            ctx.task.title,
            ctx.execution_process
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );

        // Notification daemons block on some platforms; keep it off the
        // runtime threads.
        let result = tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(title)
                .body(&body)
                .show()
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!("Desktop notification failed: {e}"),
            Err(e) => tracing::debug!("Notification task join error: {e}"),
        }
    }
}
