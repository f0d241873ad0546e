//! Filesystem watch on the script behind a server's launch command.
//!
//! Only one path is watched per running server. Which path is chosen is a
//! heuristic: the first command element that looks like an interpreted
//! script. Commands without one (compiled binaries, `npx some-package`) get
//! no watcher and never auto-restart.
//!
//! The parent directory is watched rather than the file itself, so editors
//! that save by renaming a temporary file over the script still count as a
//! change.

use crate::error::SupervisorError;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Extensions treated as interpretable scripts.
pub const SCRIPT_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "ts", "mts", "cts", "jsx", "tsx", "py", "rb", "pl", "php", "lua", "sh",
];

/// Pick the watch target for a launch command.
///
/// Relative paths are returned as written; they are not resolved against any
/// working directory.
pub fn watch_target(command: &[String]) -> Option<PathBuf> {
    command
        .iter()
        .find(|part| is_script(part))
        .map(PathBuf::from)
}

fn is_script(part: &str) -> bool {
    Path::new(part)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Notifications from a [`ChangeWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file was written or replaced.
    Changed,
    /// The subscription is dead; no further events will follow.
    Error(String),
}

/// A live subscription on one path. Dropping it unsubscribes.
pub struct ChangeWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ChangeWatcher {
    /// Subscribe to changes of `path`. The current file state produces no event.
    ///
    /// Fails when `path` does not name an existing file.
    pub fn watch(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), SupervisorError> {
        let not_watchable = |message: &str| SupervisorError::Watcher {
            path: path.display().to_string(),
            message: message.to_string(),
        };
        if !path.is_file() {
            return Err(not_watchable("no such file"));
        }
        let name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| not_watchable("path has no file name"))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let target = path.to_path_buf();
        let watched_dir = dir.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(event) => {
                        match classify(&event, &watched_dir, &name, || target.is_file()) {
                            Some(event) => event,
                            None => return,
                        }
                    }
                    Err(e) => WatchEvent::Error(e.to_string()),
                };
                let _ = tx.send(event);
            },
        )
        .map_err(|e| watch_error(path, e))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(path, e))?;

        Ok((
            Self {
                path: path.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Map a directory event to a notification about the watched file.
///
/// `target_exists` is consulted only for events that may have taken the file
/// away: a rename or removal that left a file in place is a replacement.
fn classify(
    event: &Event,
    dir: &Path,
    name: &OsString,
    target_exists: impl FnOnce() -> bool,
) -> Option<WatchEvent> {
    let is_target = |p: &PathBuf| p.file_name() == Some(name.as_os_str());

    if matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|p| p == dir) {
        return Some(WatchEvent::Error("watched directory was removed".to_string()));
    }

    match &event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            event.paths.iter().any(is_target).then_some(WatchEvent::Changed)
        }
        // Both: paths are [from, to].
        EventKind::Modify(ModifyKind::Name(RenameMode::Both))
            if event.paths.last().is_some_and(is_target) =>
        {
            Some(WatchEvent::Changed)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().any(is_target).then_some(WatchEvent::Changed)
        }
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => {
            if !event.paths.iter().any(is_target) {
                return None;
            }
            if target_exists() {
                Some(WatchEvent::Changed)
            } else {
                Some(WatchEvent::Error("watched path was removed".to_string()))
            }
        }
        _ => None,
    }
}

fn watch_error(path: &Path, error: notify::Error) -> SupervisorError {
    SupervisorError::Watcher {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}
