use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
};

use axum::response::sse::Event;
use futures::{StreamExt, TryStreamExt, future};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;

use crate::{log_msg::LogMsg, stream_lines::LinesStreamExt};

// 100 MB of raw chunks per store
const HISTORY_BYTES: usize = 100_000 * 1024;
// Patches are bounded by count; entry indices are never reused after eviction
const HISTORY_PATCHES: usize = 8192;

#[derive(Clone)]
struct StoredMsg {
    msg: LogMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
    patch_count: usize,
    finished: bool,
}

impl Inner {
    fn evict_oldest_raw(&mut self) -> bool {
        let Some(pos) = self
            .history
            .iter()
            .position(|s| matches!(s.msg, LogMsg::Stdout(_) | LogMsg::Stderr(_)))
        else {
            return false;
        };
        let removed = self.history.remove(pos).unwrap();
        self.total_bytes = self.total_bytes.saturating_sub(removed.bytes);
        // Leave a marker where history was cut, once per cut site
        if !matches!(
            self.history.get(pos).map(|s| &s.msg),
            Some(LogMsg::Truncated)
        ) {
            self.history.insert(
                pos,
                StoredMsg {
                    msg: LogMsg::Truncated,
                    bytes: LogMsg::Truncated.approx_bytes(),
                },
            );
        }
        true
    }

    fn evict_oldest_patch(&mut self) {
        if let Some(pos) = self
            .history
            .iter()
            .position(|s| matches!(s.msg, LogMsg::JsonPatch(_)))
        {
            let removed = self.history.remove(pos).unwrap();
            self.total_bytes = self.total_bytes.saturating_sub(removed.bytes);
            self.patch_count = self.patch_count.saturating_sub(1);
        }
    }
}

/// Per-execution message store: bounded replayable history plus broadcast
/// fan-out to live subscribers. Once `Finished` has been pushed the store is
/// sealed and further pushes are dropped.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(10000);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                patch_count: 0,
                finished: false,
            }),
            sender,
        }
    }

    pub fn push(&self, msg: LogMsg) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.finished {
                return;
            }
            if matches!(msg, LogMsg::Finished) {
                inner.finished = true;
            }

            let bytes = msg.approx_bytes();
            if matches!(msg, LogMsg::Stdout(_) | LogMsg::Stderr(_)) {
                while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
                    if !inner.evict_oldest_raw() {
                        break;
                    }
                }
            }
            if matches!(msg, LogMsg::JsonPatch(_)) {
                inner.patch_count += 1;
                while inner.patch_count > HISTORY_PATCHES {
                    inner.evict_oldest_patch();
                }
            }
            inner.history.push_back(StoredMsg {
                msg: msg.clone(),
                bytes,
            });
            inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        }
        let _ = self.sender.send(msg); // live listeners
    }

    // Convenience
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stdout(s.into()));
    }
    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stderr(s.into()));
    }
    pub fn push_patch(&self, patch: json_patch::Patch) {
        self.push(LogMsg::JsonPatch(patch));
    }
    pub fn push_session_id(&self, session_id: String) {
        self.push(LogMsg::SessionId(session_id));
    }
    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<LogMsg> {
        self.sender.subscribe()
    }

    pub fn get_history(&self) -> Vec<LogMsg> {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    /// History then live, as `LogMsg`. The subscription is registered before
    /// the snapshot is taken so no message can fall between replay and tail;
    /// duplicates at the seam are tolerated by the patch protocol.
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<LogMsg, std::io::Error>> {
        let rx = self.get_receiver();
        let (history, finished) = {
            let inner = self.inner.read().unwrap();
            (
                inner.history.iter().map(|s| s.msg.clone()).collect::<Vec<_>>(),
                inner.finished,
            )
        };

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));
        if finished {
            // Sealed store: replay alone is the full stream
            return Box::pin(hist);
        }
        let live = BroadcastStream::new(rx)
            .filter_map(|res| async move { res.ok().map(Ok::<_, std::io::Error>) });

        Box::pin(hist.chain(live))
    }

    pub fn stdout_chunked_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<String, std::io::Error>> {
        self.history_plus_stream()
            .take_while(|res| future::ready(!matches!(res, Ok(LogMsg::Finished))))
            .filter_map(|res| async move {
                match res {
                    Ok(LogMsg::Stdout(s)) => Some(Ok(s)),
                    _ => None,
                }
            })
            .boxed()
    }

    pub fn stdout_lines_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, std::io::Result<String>> {
        self.stdout_chunked_stream().lines()
    }

    pub fn stderr_chunked_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<String, std::io::Error>> {
        self.history_plus_stream()
            .take_while(|res| future::ready(!matches!(res, Ok(LogMsg::Finished))))
            .filter_map(|res| async move {
                match res {
                    Ok(LogMsg::Stderr(s)) => Some(Ok(s)),
                    _ => None,
                }
            })
            .boxed()
    }

    pub fn stderr_lines_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, std::io::Result<String>> {
        self.stderr_chunked_stream().lines()
    }

    /// Same stream but mapped to `Event` for SSE handlers.
    pub fn sse_stream(&self) -> futures::stream::BoxStream<'static, Result<Event, std::io::Error>> {
        self.history_plus_stream()
            .map_ok(|m| m.to_sse_event())
            .boxed()
    }

    /// Forward a stream of typed log messages into this store.
    pub fn spawn_forwarder<S, E>(self: Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: futures::Stream<Item = Result<LogMsg, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);

            while let Some(next) = stream.next().await {
                match next {
                    Ok(msg) => self.push(msg),
                    Err(e) => self.push(LogMsg::Stderr(format!("stream error: {e}"))),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_after_finished_is_dropped() {
        let store = MsgStore::new();
        store.push_stdout("before");
        store.push_finished();
        store.push_stdout("after");
        store.push_finished();

        let history = store.get_history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], LogMsg::Stdout(_)));
        assert!(matches!(history[1], LogMsg::Finished));
        assert!(store.is_finished());
    }

    #[test]
    fn history_preserves_order() {
        let store = MsgStore::new();
        store.push_stdout("a");
        store.push_stderr("b");
        store.push_stdout("c");

        let kinds: Vec<&'static str> = store.get_history().iter().map(|m| m.name()).collect();
        assert_eq!(kinds, vec!["stdout", "stderr", "stdout"]);
    }

    #[tokio::test]
    async fn history_plus_stream_replays_then_ends_when_sealed() {
        let store = MsgStore::new();
        store.push_stdout("one");
        store.push_finished();

        let msgs: Vec<LogMsg> = store
            .history_plus_stream()
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await;
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs.last(), Some(LogMsg::Finished)));
    }
}
