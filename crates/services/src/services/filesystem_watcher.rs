use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{
    SinkExt,
    channel::mpsc::{Receiver, channel},
};
use ignore::{
    WalkBuilder,
    gitignore::{Gitignore, GitignoreBuilder},
};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilesystemWatcherError {
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Ignore(#[from] ignore::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

fn canonicalize_lossy(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn build_gitignore_set(root: &Path) -> Result<Gitignore, FilesystemWatcherError> {
    let mut builder = GitignoreBuilder::new(root);

    // Collect every .gitignore under root; the walk itself must not apply
    // default filters or it would skip the files we're after.
    for result in WalkBuilder::new(root)
        .follow_links(false)
        .hidden(false)
        .standard_filters(false)
        .git_ignore(false)
        .git_exclude(false)
        .build()
    {
        let dir_entry = result?;
        if dir_entry
            .file_type()
            .map(|ft| ft.is_file())
            .unwrap_or(false)
            && dir_entry
                .path()
                .file_name()
                .is_some_and(|name| name == ".gitignore")
        {
            builder.add(dir_entry.path());
        }
    }

    let info_exclude = root.join(".git/info/exclude");
    if info_exclude.exists() {
        builder.add(info_exclude);
    }

    Ok(builder.build()?)
}

fn path_allowed(path: &PathBuf, gi: &Gitignore, canonical_root: &Path) -> bool {
    let canonical_path = canonicalize_lossy(path);

    let relative_path = match canonical_path.strip_prefix(canonical_root) {
        Ok(rel_path) => rel_path,
        // Outside the watched root: let it through
        Err(_) => return true,
    };

    // Git internals churn constantly and never affect the diff
    if relative_path.starts_with(".git") {
        return false;
    }

    // Heuristic: paths without extensions are likely directories; avoids a
    // stat per event
    let is_dir = relative_path.extension().is_none();
    let matched = gi.matched_path_or_any_parents(relative_path, is_dir);

    !matched.is_ignore()
}

fn debounced_should_forward(event: &DebouncedEvent, gi: &Gitignore, canonical_root: &Path) -> bool {
    event
        .paths
        .iter()
        .all(|path| path_allowed(path, gi, canonical_root))
}

/// Debounced recursive watcher over a worktree, filtered through its
/// gitignore set. Drives the live diff stream.
pub fn async_watcher(
    root: PathBuf,
) -> Result<
    (
        Debouncer<RecommendedWatcher, RecommendedCache>,
        Receiver<DebounceEventResult>,
        PathBuf,
    ),
    FilesystemWatcherError,
> {
    let canonical_root = canonicalize_lossy(&root);
    let gi_set = Arc::new(build_gitignore_set(&canonical_root)?);
    let (mut tx, rx) = channel(64);

    let gi_clone = gi_set.clone();
    let root_clone = canonical_root.clone();

    let mut debouncer = new_debouncer(
        Duration::from_millis(200),
        None,
        move |res: DebounceEventResult| match res {
            Ok(events) => {
                let filtered_events: Vec<DebouncedEvent> = events
                    .into_iter()
                    .filter(|ev| debounced_should_forward(ev, &gi_clone, &root_clone))
                    .collect();

                if !filtered_events.is_empty() {
                    futures::executor::block_on(async {
                        tx.send(Ok(filtered_events)).await.ok();
                    });
                }
            }
            Err(errors) => {
                futures::executor::block_on(async {
                    tx.send(Err(errors)).await.ok();
                });
            }
        },
    )?;

    debouncer.watch(&canonical_root, RecursiveMode::Recursive)?;

    Ok((debouncer, rx, canonical_root))
}
