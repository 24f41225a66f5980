use axum::{
    BoxError, Router,
    extract::State,
    http::HeaderMap,
    response::{
        Sse,
        sse::{Event, KeepAlive},
    },
    routing::get,
};
use deployment::Deployment;
use futures_util::{StreamExt, TryStreamExt};

use crate::DeploymentImpl;

/// SSE event feed of row changes. Events carry increasing ids; a
/// `Last-Event-ID` header skips the already-seen prefix of the bounded
/// replay history.
pub async fn events(
    State(deployment): State<DeploymentImpl>,
    headers: HeaderMap,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, BoxError>>>, axum::http::StatusCode>
{
    let last_seen: usize = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let stream = deployment
        .events()
        .msg_store()
        .history_plus_stream()
        .enumerate()
        .filter_map(move |(index, msg)| async move {
            let event_id = index + 1;
            if event_id <= last_seen {
                return None;
            }
            Some(msg.map(|m| m.to_sse_event().id(event_id.to_string())))
        })
        .map_err(|e| -> BoxError { e.into() });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/events", get(events))
}
