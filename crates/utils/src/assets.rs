use std::path::PathBuf;

use directories::ProjectDirs;

/// Root data directory for the orchestrator. `DATA_DIR` overrides the
/// platform-standard user-data directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DATA_DIR") {
        return PathBuf::from(dir);
    }

    let proj = if cfg!(debug_assertions) {
        ProjectDirs::from("dev", "workhorse-dev", "workhorse")
    } else {
        ProjectDirs::from("dev", "workhorse", "workhorse")
    };

    proj.expect("OS didn't give us a home directory")
        .data_dir()
        .to_path_buf()
}

/// Database file location. `DB_PATH` overrides the default inside the data
/// directory.
pub fn db_path() -> PathBuf {
    if let Ok(path) = std::env::var("DB_PATH") {
        return PathBuf::from(path);
    }
    data_dir().join("db.sqlite")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Base directory under which workspace containers are materialized.
pub fn workspace_base_dir() -> PathBuf {
    data_dir().join("workspaces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_defaults_under_data_dir() {
        // Only exercise the default resolution when the overrides are unset;
        // CI environments may pin DATA_DIR.
        if std::env::var("DB_PATH").is_err() && std::env::var("DATA_DIR").is_err() {
            assert!(db_path().starts_with(data_dir()));
        }
    }
}
