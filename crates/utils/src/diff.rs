use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiffDetails {
    pub file_name: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub old_file: Option<FileDiffDetails>,
    pub new_file: Option<FileDiffDetails>,
    pub hunks: Vec<String>,
}

impl Diff {
    /// Stable key used to address this file in a diff stream.
    pub fn path(&self) -> String {
        self.new_file
            .as_ref()
            .and_then(|f| f.file_name.clone())
            .or_else(|| self.old_file.as_ref().and_then(|f| f.file_name.clone()))
            .unwrap_or_default()
    }
}

/// Converts a replace diff to a unified diff hunk without the file header.
pub fn create_unified_diff_hunk(old: &str, new: &str) -> String {
    // normalize ending line feed to optimize diff output
    let mut old = old.to_string();
    let mut new = new.to_string();
    if !old.ends_with('\n') {
        old.push('\n');
    }
    if !new.ends_with('\n') {
        new.push('\n');
    }

    let diff = TextDiff::from_lines(&old, &new);

    let mut out = String::new();

    let old_count = diff.old_slices().len();
    let new_count = diff.new_slices().len();
    out.push_str(&format!("@@ -0,{old_count} +0,{new_count} @@\n"));

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Equal => ' ',
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
        };
        out.push(sign);
        out.push_str(change.value());
    }

    out
}

/// Creates a full unified diff with the file path in the header.
pub fn create_unified_diff(file_path: &str, old: &str, new: &str) -> String {
    let mut out = String::new();
    out.push_str(format!("--- a/{file_path}\n+++ b/{file_path}\n").as_str());
    out.push_str(&create_unified_diff_hunk(old, new));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hunk_marks_insertions() {
        let hunk = create_unified_diff_hunk("a\nb\n", "a\nb\nc\n");
        assert!(hunk.contains("+c\n"));
        assert!(!hunk.contains("-a\n"));
    }

    #[test]
    fn diff_path_prefers_new_file() {
        let diff = Diff {
            old_file: Some(FileDiffDetails {
                file_name: Some("old.rs".into()),
                content: None,
            }),
            new_file: Some(FileDiffDetails {
                file_name: Some("new.rs".into()),
                content: None,
            }),
            hunks: vec![],
        };
        assert_eq!(diff.path(), "new.rs");
    }
}
