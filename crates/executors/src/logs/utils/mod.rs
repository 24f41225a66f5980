pub mod entry_index;
pub mod patch;

pub use entry_index::EntryIndexProvider;
pub use patch::ConversationPatch;
