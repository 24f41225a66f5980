use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use utils::{log_msg::LogMsg, msg_store::MsgStore};

use super::ConversationPatch;

/// Thread-safe provider of monotonically increasing entry indexes. Shared
/// between the stdout and stderr normalizers of one execution so indices
/// interleave without collisions and are never reused.
#[derive(Debug, Clone)]
pub struct EntryIndexProvider(Arc<AtomicUsize>);

impl EntryIndexProvider {
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    /// Continue numbering after whatever entries already sit in the store's
    /// history. Needed when a normalizer attaches to a store that was
    /// pre-seeded (e.g. with the user prompt entry).
    pub fn start_from(msg_store: &MsgStore) -> Self {
        let next = msg_store
            .get_history()
            .iter()
            .filter_map(|msg| match msg {
                LogMsg::JsonPatch(patch) => ConversationPatch::extract_normalized_entries(patch)
                    .into_iter()
                    .map(|(index, _)| index)
                    .max(),
                _ => None,
            })
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        Self(Arc::new(AtomicUsize::new(next)))
    }

    /// Get the next available index
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the current index without incrementing
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for EntryIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{NormalizedEntry, NormalizedEntryType};

    #[test]
    fn test_entry_index_provider() {
        let provider = EntryIndexProvider::new();
        assert_eq!(provider.next(), 0);
        assert_eq!(provider.next(), 1);
        assert_eq!(provider.next(), 2);
    }

    #[test]
    fn test_entry_index_provider_clone() {
        let provider1 = EntryIndexProvider::new();
        let provider2 = provider1.clone();

        assert_eq!(provider1.next(), 0);
        assert_eq!(provider2.next(), 1);
        assert_eq!(provider1.next(), 2);
    }

    #[test]
    fn start_from_resumes_after_seeded_entries() {
        let store = MsgStore::new();
        store.push_patch(ConversationPatch::add_normalized_entry(
            0,
            NormalizedEntry {
                timestamp: None,
                entry_type: NormalizedEntryType::UserMessage,
                content: "hi".to_string(),
                metadata: None,
            },
        ));

        let provider = EntryIndexProvider::start_from(&store);
        assert_eq!(provider.next(), 1);
    }
}
