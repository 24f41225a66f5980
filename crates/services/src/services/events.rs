use std::{str::FromStr, sync::Arc};

use axum::response::sse::Event;
use db::{
    ConnectionHook, DBService,
    models::{execution_process::ExecutionProcess, task::Task, workspace::Workspace},
};
use futures::{StreamExt, TryStreamExt};
use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation};
use serde_json::json;
use sqlx::sqlite::SqliteOperation;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_stream::wrappers::BroadcastStream;
use utils::{log_msg::LogMsg, msg_store::MsgStore};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

#[derive(EnumString, Display)]
enum HookTables {
    #[strum(to_string = "tasks")]
    Tasks,
    #[strum(to_string = "workspaces")]
    Workspaces,
    #[strum(to_string = "execution_processes")]
    ExecutionProcesses,
}

fn escape_pointer_segment(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn keyed_patch(prefix: &str, id: Uuid, op: &SqliteOperation, value: serde_json::Value) -> Patch {
    let path = format!("/{prefix}/{}", escape_pointer_segment(&id.to_string()));
    let pointer = path.try_into().expect("patch path should be valid");
    Patch(vec![match op {
        SqliteOperation::Insert => PatchOperation::Add(AddOperation { path: pointer, value }),
        SqliteOperation::Delete => PatchOperation::Remove(RemoveOperation { path: pointer }),
        _ => PatchOperation::Replace(ReplaceOperation { path: pointer, value }),
    }])
}

/// Row-change event fan-out. A sqlite update hook converts table changes
/// into JSON patches against virtual `/workspaces`, `/tasks` and
/// `/execution_processes` maps, broadcast through one shared message store
/// with bounded replayable history.
#[derive(Clone)]
pub struct EventService {
    msg_store: Arc<MsgStore>,
    db: DBService,
    entry_count: Arc<RwLock<usize>>,
}

impl EventService {
    pub fn new(db: DBService, msg_store: Arc<MsgStore>, entry_count: Arc<RwLock<usize>>) -> Self {
        Self {
            msg_store,
            db,
            entry_count,
        }
    }

    pub fn msg_store(&self) -> &Arc<MsgStore> {
        &self.msg_store
    }

    pub async fn next_event_id(&self) -> usize {
        let mut count = self.entry_count.write().await;
        *count += 1;
        *count
    }

    /// The `after_connect` hook for `DBService::new_with_after_connect`.
    /// Row lookups and patch construction run on separate tasks so the
    /// hook never blocks the writing connection.
    pub fn create_hook(
        msg_store: Arc<MsgStore>,
        db_service: DBService,
    ) -> ConnectionHook {
        Arc::new(move |conn: &mut sqlx::sqlite::SqliteConnection| {
            let msg_store_for_hook = msg_store.clone();
            let db_for_hook = db_service.clone();

            Box::pin(async move {
                let mut handle = conn.lock_handle().await?;
                let runtime_handle = tokio::runtime::Handle::current();
                handle.set_update_hook(move |hook: sqlx::sqlite::UpdateHookResult<'_>| {
                    let Ok(table) = HookTables::from_str(hook.table) else {
                        return;
                    };
                    let msg_store = msg_store_for_hook.clone();
                    let db = db_for_hook.clone();
                    let rowid = hook.rowid;
                    let operation = hook.operation.clone();

                    runtime_handle.spawn(async move {
                        let patch = match (table, &operation) {
                            (HookTables::Tasks, SqliteOperation::Delete) => {
                                // Row is already gone; only the rowid is known
                                Self::tombstone_patch("tasks", rowid)
                            }
                            (HookTables::Workspaces, SqliteOperation::Delete) => {
                                Self::tombstone_patch("workspaces", rowid)
                            }
                            (HookTables::ExecutionProcesses, SqliteOperation::Delete) => {
                                Self::tombstone_patch("execution_processes", rowid)
                            }
                            (HookTables::Tasks, op) => {
                                match Task::find_by_rowid(&db.pool, rowid).await {
                                    Ok(Some(task)) => Some(keyed_patch(
                                        "tasks",
                                        task.id,
                                        op,
                                        serde_json::to_value(&task).unwrap_or(json!(null)),
                                    )),
                                    _ => None,
                                }
                            }
                            (HookTables::Workspaces, op) => {
                                match Workspace::find_by_rowid(&db.pool, rowid).await {
                                    Ok(Some(workspace)) => Some(keyed_patch(
                                        "workspaces",
                                        workspace.id,
                                        op,
                                        serde_json::to_value(&workspace).unwrap_or(json!(null)),
                                    )),
                                    _ => None,
                                }
                            }
                            (HookTables::ExecutionProcesses, op) => {
                                match ExecutionProcess::find_by_rowid(&db.pool, rowid).await {
                                    Ok(Some(process)) => Some(keyed_patch(
                                        "execution_processes",
                                        process.id,
                                        op,
                                        serde_json::to_value(&process).unwrap_or(json!(null)),
                                    )),
                                    _ => None,
                                }
                            }
                        };

                        if let Some(patch) = patch {
                            msg_store.push_patch(patch);
                        }
                    });
                });

                Ok(())
            })
        })
    }

    fn tombstone_patch(prefix: &str, rowid: i64) -> Option<Patch> {
        // Deletions surface as a patch on a rowid-keyed tombstone path;
        // clients treat any removal under the prefix as cache invalidation.
        let path = format!("/{prefix}/rowid:{rowid}");
        serde_json::from_value(json!([{ "op": "remove", "path": path }])).ok()
    }

    /// Snapshot of all workspaces keyed by id, then live workspace patches.
    pub async fn stream_workspaces(
        &self,
    ) -> Result<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>, EventError>
    {
        let workspaces = Workspace::fetch_all(&self.db.pool, None, None, None).await?;
        let map: serde_json::Map<String, serde_json::Value> = workspaces
            .into_iter()
            .map(|w| (w.id.to_string(), serde_json::to_value(&w).unwrap_or(json!(null))))
            .collect();

        let initial_patch = json!([{ "op": "replace", "path": "/workspaces", "value": map }]);
        let initial_msg = LogMsg::JsonPatch(serde_json::from_value(initial_patch)?);

        let live = BroadcastStream::new(self.msg_store.get_receiver()).filter_map(|msg| async move {
            match msg {
                Ok(LogMsg::JsonPatch(patch))
                    if patch
                        .0
                        .first()
                        .is_some_and(|op| op.path().starts_with("/workspaces/")) =>
                {
                    Some(Ok(LogMsg::JsonPatch(patch)))
                }
                _ => None,
            }
        });

        Ok(futures::stream::once(async move { Ok(initial_msg) })
            .chain(live)
            .map_ok(|m: LogMsg| m.to_sse_event())
            .boxed())
    }

    /// Snapshot of a session's processes, then live process patches scoped
    /// to that session.
    pub async fn stream_processes_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<futures::stream::BoxStream<'static, Result<Event, std::io::Error>>, EventError>
    {
        let processes =
            ExecutionProcess::find_by_session_id(&self.db.pool, session_id, true).await?;
        let initial_patch = json!([{
            "op": "replace",
            "path": "/execution_processes",
            "value": processes,
        }]);
        let initial_msg = LogMsg::JsonPatch(serde_json::from_value(initial_patch)?);

        let live = BroadcastStream::new(self.msg_store.get_receiver()).filter_map(move |msg| {
            async move {
                match msg {
                    Ok(LogMsg::JsonPatch(patch)) => {
                        let relevant = patch.0.first().is_some_and(|op| {
                            op.path().starts_with("/execution_processes/")
                        });
                        if !relevant {
                            return None;
                        }
                        // Scope to the session when the payload carries one
                        let value = serde_json::to_value(&patch).ok()?;
                        let matches_session = value
                            .as_array()?
                            .iter()
                            .filter_map(|op| op.get("value"))
                            .filter_map(|v| v.get("session_id"))
                            .filter_map(|s| s.as_str())
                            .all(|s| s == session_id.to_string());
                        matches_session.then_some(Ok(LogMsg::JsonPatch(patch)))
                    }
                    _ => None,
                }
            }
        });

        Ok(futures::stream::once(async move { Ok(initial_msg) })
            .chain(live)
            .map_ok(|m: LogMsg| m.to_sse_event())
            .boxed())
    }
}
