use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::{from_value, json};
use utils::diff::Diff;

use crate::logs::NormalizedEntry;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum PatchOperation {
    Add,
    Replace,
    Remove,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "content")]
pub enum PatchType {
    NormalizedEntry(NormalizedEntry),
    Stdout(String),
    Stderr(String),
    Diff(Diff),
}

#[derive(Serialize)]
struct PatchEntry {
    op: PatchOperation,
    path: String,
    value: PatchType,
}

pub fn escape_json_pointer_segment(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

/// Helper functions to create JSON patches for conversation entries
pub struct ConversationPatch;

impl ConversationPatch {
    /// ADD patch for a new conversation entry at the given index
    pub fn add_normalized_entry(entry_index: usize, entry: NormalizedEntry) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Add,
            path: format!("/entries/{entry_index}"),
            value: PatchType::NormalizedEntry(entry),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    /// REPLACE patch transitioning the entry already present at the index.
    /// This is how tool-status updates are broadcast in place.
    pub fn replace(entry_index: usize, entry: NormalizedEntry) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Replace,
            path: format!("/entries/{entry_index}"),
            value: PatchType::NormalizedEntry(entry),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    pub fn add_stdout(entry_index: usize, entry: String) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Add,
            path: format!("/entries/{entry_index}"),
            value: PatchType::Stdout(entry),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    pub fn add_stderr(entry_index: usize, entry: String) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Add,
            path: format!("/entries/{entry_index}"),
            value: PatchType::Stderr(entry),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    pub fn add_diff(entry_key: String, diff: Diff) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Add,
            path: format!("/entries/{entry_key}"),
            value: PatchType::Diff(diff),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    pub fn replace_diff(entry_key: String, diff: Diff) -> Patch {
        let patch_entry = PatchEntry {
            op: PatchOperation::Replace,
            path: format!("/entries/{entry_key}"),
            value: PatchType::Diff(diff),
        };

        from_value(json!([patch_entry])).unwrap()
    }

    pub fn remove_diff(entry_key: String) -> Patch {
        from_value(json!([{
            "op": "remove",
            "path": format!("/entries/{entry_key}"),
        }]))
        .unwrap()
    }

    /// Extract `(index, entry)` pairs carried by a patch. Only entries under
    /// `/entries/<n>` with a numeric index are returned; diff patches and
    /// raw stdout/stderr patches are skipped.
    pub fn extract_normalized_entries(patch: &Patch) -> Vec<(usize, NormalizedEntry)> {
        let Ok(patch_json) = serde_json::to_value(patch) else {
            return Vec::new();
        };
        let Some(operations) = patch_json.as_array() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for operation in operations {
            let Some(path) = operation.get("path").and_then(|p| p.as_str()) else {
                continue;
            };
            let Some(index) = path
                .strip_prefix("/entries/")
                .and_then(|i| i.parse::<usize>().ok())
            else {
                continue;
            };
            let Some(value) = operation.get("value") else {
                continue;
            };
            if value.get("type").and_then(|t| t.as_str()) != Some("NORMALIZED_ENTRY") {
                continue;
            }
            if let Some(content) = value.get("content")
                && let Ok(entry) = serde_json::from_value::<NormalizedEntry>(content.clone())
            {
                out.push((index, entry));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{NormalizedEntryType, ToolStatus};

    fn tool_entry(tool_call_id: &str) -> NormalizedEntry {
        NormalizedEntry {
            timestamp: None,
            entry_type: NormalizedEntryType::ToolUse {
                tool_name: "bash".to_string(),
                action_type: crate::logs::ActionType::CommandRun {
                    command: "ls".to_string(),
                },
                status: ToolStatus::Created,
            },
            content: "ls".to_string(),
            metadata: Some(serde_json::json!({ "tool_call_id": tool_call_id })),
        }
    }

    #[test]
    fn extract_round_trips_entries() {
        let patch = ConversationPatch::add_normalized_entry(3, tool_entry("call_1"));
        let extracted = ConversationPatch::extract_normalized_entries(&patch);
        assert_eq!(extracted.len(), 1);
        let (index, entry) = &extracted[0];
        assert_eq!(*index, 3);
        assert_eq!(entry.tool_call_id(), Some("call_1"));
    }

    #[test]
    fn extract_skips_diff_patches() {
        let patch = ConversationPatch::add_diff(
            "src~1main.rs".to_string(),
            utils::diff::Diff {
                old_file: None,
                new_file: None,
                hunks: vec![],
            },
        );
        assert!(ConversationPatch::extract_normalized_entries(&patch).is_empty());
    }

    #[test]
    fn replace_twice_yields_identical_state() {
        // Applying the same status replace twice must be a no-op the second
        // time from the consumer's point of view.
        let mut doc = serde_json::json!({ "entries": { "0": null } });
        let add = ConversationPatch::add_normalized_entry(0, tool_entry("call_2"));
        json_patch::patch(&mut doc, &add).unwrap();

        let replaced = tool_entry("call_2")
            .with_tool_status(ToolStatus::TimedOut)
            .unwrap();
        let replace = ConversationPatch::replace(0, replaced);

        let mut once = doc.clone();
        json_patch::patch(&mut once, &replace).unwrap();
        let mut twice = doc.clone();
        json_patch::patch(&mut twice, &replace).unwrap();
        json_patch::patch(&mut twice, &replace).unwrap();

        assert_eq!(once, twice);
    }
}
