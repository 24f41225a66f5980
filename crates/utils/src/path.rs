use std::path::Path;

/// Convert absolute paths to relative paths based on a worktree path.
/// Handles symlinked worktrees by falling back to canonicalized prefixes.
pub fn make_path_relative(path: &str, worktree_path: &str) -> String {
    let path_obj = Path::new(path);
    let worktree_path_obj = Path::new(worktree_path);

    if path_obj.is_relative() {
        return path.to_string();
    }

    match path_obj.strip_prefix(worktree_path_obj) {
        Ok(relative_path) => relative_path.to_string_lossy().to_string(),
        Err(_) => {
            let canonical_path = std::fs::canonicalize(path);
            let canonical_worktree = std::fs::canonicalize(worktree_path);

            match (canonical_path, canonical_worktree) {
                (Ok(canon_path), Ok(canon_worktree)) => {
                    match canon_path.strip_prefix(&canon_worktree) {
                        Ok(relative_path) => relative_path.to_string_lossy().to_string(),
                        Err(_) => path.to_string(),
                    }
                }
                _ => path.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_path_relative() {
        // Relative paths pass through unchanged
        assert_eq!(
            make_path_relative("src/main.rs", "/tmp/test-worktree"),
            "src/main.rs"
        );

        let test_worktree = "/tmp/test-worktree";
        let absolute_path = format!("{test_worktree}/src/main.rs");
        assert_eq!(
            make_path_relative(&absolute_path, test_worktree),
            "src/main.rs"
        );

        // Paths outside the worktree are returned as-is
        assert_eq!(
            make_path_relative("/other/path/file.js", "/tmp/test-worktree"),
            "/other/path/file.js"
        );
    }
}
