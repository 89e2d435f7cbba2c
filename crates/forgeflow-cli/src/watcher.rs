//! PRD file watcher for `forgeflow watch`.
//!
//! The parent directory is watched rather than the file itself because the
//! store persists by renaming a temp file over the PRD, which would orphan
//! a watch on the original inode.

use forgeflow_core::{ForgeflowError, ForgeflowResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Delivers one notification per burst of writes to a single file.
pub struct PrdWatcher {
    /// Dropping the watcher stops the watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
}

impl PrdWatcher {
    pub fn start(prd_path: &Path, debounce: Duration) -> ForgeflowResult<Self> {
        let file_name = prd_path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| {
                ForgeflowError::Config(format!("Not a file path: {}", prd_path.display()))
            })?;
        let dir = match prd_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if touches(&event, &file_name) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "File watch error"),
            }
        })
        .map_err(|e| ForgeflowError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ForgeflowError::Config(format!("Failed to watch {}: {e}", dir.display()))
            })?;

        tracing::info!(path = %prd_path.display(), "Watching PRD for changes");
        Ok(Self {
            _watcher: watcher,
            rx,
            debounce,
        })
    }

    /// Wait for the next change, then let the burst settle.
    ///
    /// Returns `false` once the watcher has shut down.
    pub async fn changed(&mut self) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        tokio::time::sleep(self.debounce).await;
        while self.rx.try_recv().is_ok() {}
        true
    }

    /// Discard notifications queued so far, e.g. those caused by a run.
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Whether a filesystem event is a write or rename onto `file_name`.
fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|n| n == file_name.as_os_str()))
}

/// A change is external when the file on disk differs from what the store
/// last wrote or read.
pub fn is_external_change(on_disk: &str, last_written: Option<&str>) -> bool {
    last_written != Some(on_disk)
}

/// Content of the PRD when it differs from what the store last wrote or read.
pub async fn external_edit(
    path: &Path,
    last_written: Option<&str>,
) -> std::io::Result<Option<String>> {
    let on_disk = tokio::fs::read_to_string(path).await?;
    Ok(is_external_change(&on_disk, last_written).then_some(on_disk))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_touches_matches_writes_to_the_prd() {
        let name = OsString::from("prd.json");
        assert!(touches(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/w/prd.json"),
            &name
        ));
        assert!(touches(&event(EventKind::Create(CreateKind::File), "/w/prd.json"), &name));
    }

    #[test]
    fn test_touches_ignores_other_files_and_removals() {
        let name = OsString::from("prd.json");
        assert!(!touches(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/w/prd.json.tmp"),
            &name
        ));
        assert!(!touches(&event(EventKind::Remove(RemoveKind::File), "/w/prd.json"), &name));
    }

    #[test]
    fn test_own_writes_are_not_external() {
        assert!(!is_external_change("{\"a\":1}", Some("{\"a\":1}")));
        assert!(is_external_change("{\"a\":2}", Some("{\"a\":1}")));
        assert!(is_external_change("{}", None));
    }

    #[tokio::test]
    async fn test_external_edit_sees_changes_made_during_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, "{\"tasks\":[]}").unwrap();

        let own = external_edit(&path, Some("{\"tasks\":[]}")).await.unwrap();
        assert!(own.is_none());

        std::fs::write(&path, "{\"tasks\":[1]}").unwrap();
        let edited = external_edit(&path, Some("{\"tasks\":[]}")).await.unwrap();
        assert_eq!(edited.as_deref(), Some("{\"tasks\":[1]}"));
    }

    #[tokio::test]
    async fn test_external_edit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(external_edit(&dir.path().join("gone.json"), None).await.is_err());
    }

    #[test]
    fn test_start_rejects_root_path() {
        assert!(PrdWatcher::start(Path::new("/"), Duration::from_millis(10)).is_err());
    }
}
