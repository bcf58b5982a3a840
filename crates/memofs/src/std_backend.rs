use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{collections::HashSet, io};

use crossbeam_channel::{Receiver, Sender};
use notify::RecursiveMode;
use notify_debouncer_full::{
    new_debouncer,
    notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};

use crate::{DirEntry, Metadata, ReadDir, VfsBackend, VfsEvent, DEFAULT_DEBOUNCE};

/// Critical errors from the file watcher that indicate watching is no longer reliable.
#[derive(Debug, Clone)]
pub enum WatcherCriticalError {
    /// The notify crate reported an error
    WatcherError {
        error: String,
        path: Option<PathBuf>,
    },
    /// Too many file changes caused the watcher to request a rescan
    RescanRequired,
    /// Failed to send an event through the channel
    ChannelSendFailed(String),
}

impl std::fmt::Display for WatcherCriticalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WatcherError { error, path } => {
                write!(f, "File watcher error: {} (path: {:?})", error, path)
            }
            Self::RescanRequired => {
                write!(f, "File watcher requested rescan due to too many changes")
            }
            Self::ChannelSendFailed(err) => {
                write!(f, "File watcher failed to send event: {}", err)
            }
        }
    }
}

impl std::error::Error for WatcherCriticalError {}

/// Callback type for handling critical watcher errors.
/// Return `true` to exit the watcher thread, `false` to continue (if possible).
pub type CriticalErrorHandler = Box<dyn Fn(WatcherCriticalError) -> bool + Send + Sync + 'static>;

/// `VfsBackend` that uses `std::fs` and the `notify` crate.
pub struct StdBackend {
    debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    watcher_receiver: Receiver<VfsEvent>,
    watches: HashSet<PathBuf>,
    critical_error_receiver: Receiver<WatcherCriticalError>,
}

impl StdBackend {
    /// Creates a new StdBackend with the default debounce window.
    pub fn new() -> StdBackend {
        Self::with_debounce(DEFAULT_DEBOUNCE)
    }

    /// Creates a new StdBackend that coalesces raw events inside `debounce`.
    ///
    /// A watcher error never takes the process down: file watching is best
    /// effort and the remote poller keeps the theme converging even if local
    /// events are lost. Errors are logged and forwarded to
    /// `critical_error_receiver()`.
    pub fn with_debounce(debounce: Duration) -> StdBackend {
        Self::new_with_error_handler(
            debounce,
            Box::new(|err| {
                match &err {
                    WatcherCriticalError::RescanRequired => log::warn!(
                        "File watcher requested rescan due to rapid changes. \
                         Some file events may have been missed."
                    ),
                    _ => log::error!("{}. Local edits may not be picked up.", err),
                }
                false
            }),
        )
    }

    /// Creates a new StdBackend with a custom error handler.
    ///
    /// The error handler is called when critical errors occur in the watcher thread.
    /// It receives the error and should return `true` to stop processing the
    /// current batch, or `false` to continue.
    pub fn new_with_error_handler(
        debounce: Duration,
        error_handler: CriticalErrorHandler,
    ) -> StdBackend {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (error_tx, error_rx) = crossbeam_channel::unbounded();

        let debouncer = Self::create_debouncer(debounce, event_tx, error_tx, error_handler);

        Self {
            debouncer,
            watcher_receiver: event_rx,
            watches: HashSet::new(),
            critical_error_receiver: error_rx,
        }
    }

    fn create_debouncer(
        debounce: Duration,
        event_tx: Sender<VfsEvent>,
        error_tx: Sender<WatcherCriticalError>,
        error_handler: CriticalErrorHandler,
    ) -> Debouncer<notify::RecommendedWatcher, RecommendedCache> {
        new_debouncer(debounce, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    for vfs_event in Self::convert_event(&event.event) {
                        if let Err(err) = event_tx.send(vfs_event) {
                            let critical_err =
                                WatcherCriticalError::ChannelSendFailed(err.to_string());
                            let _ = error_tx.send(critical_err.clone());
                            if error_handler(critical_err) {
                                return;
                            }
                        }
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    let critical_err = if error.paths.is_empty() {
                        WatcherCriticalError::RescanRequired
                    } else {
                        WatcherCriticalError::WatcherError {
                            error: format!("{:?}", error.kind),
                            path: error.paths.first().cloned(),
                        }
                    };
                    let _ = error_tx.send(critical_err.clone());
                    if error_handler(critical_err) {
                        return;
                    }
                }
            }
        })
        .expect("Failed to create file watcher debouncer")
    }

    /// Convert a notify event to our VfsEvent(s)
    fn convert_event(event: &notify::Event) -> Vec<VfsEvent> {
        let mut vfs_events = Vec::new();

        match &event.kind {
            EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Create(CreateKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Create(path.clone()));
                }
            }

            // Theme indexing only cares about files. A new folder produces
            // events for the files moved into it.
            EventKind::Create(CreateKind::Folder) => {}

            EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Write(path.clone()));
                }
            }

            EventKind::Modify(ModifyKind::Metadata(_)) => {}

            // Old path at [0], new path at [1]. Editors that save through a
            // temporary file show up this way.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() >= 2 {
                    vfs_events.push(VfsEvent::Remove(event.paths[0].clone()));
                    vfs_events.push(VfsEvent::Create(event.paths[1].clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Remove(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Create(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Other)) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Write(path.clone()));
                }
            }

            EventKind::Remove(RemoveKind::File)
            | EventKind::Remove(RemoveKind::Folder)
            | EventKind::Remove(RemoveKind::Any)
            | EventKind::Remove(RemoveKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Remove(path.clone()));
                }
            }

            EventKind::Access(_) => {}

            EventKind::Other | EventKind::Any => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Write(path.clone()));
                }
            }
        }

        vfs_events
    }

    /// Returns a receiver for critical errors from the watcher thread.
    pub fn critical_error_receiver(&self) -> Receiver<WatcherCriticalError> {
        self.critical_error_receiver.clone()
    }
}

impl VfsBackend for StdBackend {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        fs_err::read(path)
    }

    fn write(&mut self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs_err::write(path, data)
    }

    fn exists(&mut self, path: &Path) -> io::Result<bool> {
        std::fs::exists(path)
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        let entries: Result<Vec<_>, _> = fs_err::read_dir(path)?.collect();
        let mut entries = entries?;

        entries.sort_by_cached_key(|entry| entry.file_name());

        let inner = entries
            .into_iter()
            .map(|entry| Ok(DirEntry { path: entry.path() }));

        Ok(ReadDir {
            inner: Box::new(inner),
        })
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        fs_err::create_dir_all(path)
    }

    fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        fs_err::remove_file(path)
    }

    fn metadata(&mut self, path: &Path) -> io::Result<Metadata> {
        let inner = fs_err::metadata(path)?;

        Ok(Metadata {
            is_file: inner.is_file(),
            len: inner.len(),
        })
    }

    fn event_receiver(&self) -> crossbeam_channel::Receiver<VfsEvent> {
        self.watcher_receiver.clone()
    }

    fn watch(&mut self, path: &Path) -> io::Result<()> {
        if path
            .ancestors()
            .any(|ancestor| self.watches.contains(ancestor))
        {
            return Ok(());
        }

        // Only record the watch once notify accepted it, so a failed watch
        // can be retried.
        match self.debouncer.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                log::debug!("Watching path: {}", path.display());
                self.watches.insert(path.to_path_buf());
                Ok(())
            }
            Err(err) => {
                log::warn!("Failed to watch path {}: {:?}", path.display(), err);
                Err(io::Error::other(format!("{:?}", err)))
            }
        }
    }

    fn unwatch(&mut self, path: &Path) -> io::Result<()> {
        match self.debouncer.unwatch(path) {
            Ok(()) => {
                log::debug!("Unwatched path: {}", path.display());
                self.watches.remove(path);
                Ok(())
            }
            Err(err)
                if matches!(
                    err.kind,
                    notify::ErrorKind::WatchNotFound | notify::ErrorKind::PathNotFound
                ) =>
            {
                self.watches.remove(path);
                Ok(())
            }
            Err(err) => {
                log::warn!("Failed to unwatch path {}: {:?}", path.display(), err);
                Err(io::Error::other(format!("{:?}", err)))
            }
        }
    }
}

impl Default for StdBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quiet_backend() -> StdBackend {
        StdBackend::new_with_error_handler(
            DEFAULT_DEBOUNCE,
            Box::new(|err| {
                log::trace!("Test backend error (expected during test cleanup): {}", err);
                true
            }),
        )
    }

    fn collect_events_with_timeout(
        event_rx: &Receiver<VfsEvent>,
        timeout: Duration,
    ) -> Vec<VfsEvent> {
        let start = std::time::Instant::now();
        let mut events = Vec::new();
        while start.elapsed() < timeout {
            match event_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        events
    }

    #[test]
    fn ancestor_watch_prevents_duplicate_watches() {
        let dir = tempdir().unwrap();
        let sections = dir.path().join("sections");
        fs_err::create_dir(&sections).unwrap();
        let file_path = sections.join("header.liquid");
        fs_err::write(&file_path, "<header>").unwrap();

        let mut backend = quiet_backend();

        assert!(backend.watch(dir.path()).is_ok());
        assert!(backend.watch(&file_path).is_ok());
        assert_eq!(backend.watches.len(), 1);
    }

    #[test]
    fn unwatch_of_unknown_path_is_not_an_error() {
        let dir = tempdir().unwrap();
        let mut backend = quiet_backend();

        assert!(backend.unwatch(dir.path()).is_ok());
    }

    #[test]
    fn metadata_reports_length() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("settings_data.json");
        fs_err::write(&file_path, "{}").unwrap();

        let mut backend = quiet_backend();
        let meta = backend.metadata(&file_path).unwrap();

        assert!(meta.is_file());
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn rapid_saves_produce_a_write_event() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("theme.liquid");
        fs_err::write(&file_path, "{{ content_for_layout }}").unwrap();

        let mut backend = quiet_backend();
        let event_rx = backend.event_receiver();
        assert!(backend.watch(dir.path()).is_ok());
        std::thread::sleep(Duration::from_millis(100));

        for i in 0..10 {
            fs_err::write(&file_path, format!("{{{{ content_for_layout }}}} {}", i)).unwrap();
        }

        let events = collect_events_with_timeout(&event_rx, Duration::from_millis(500));
        let writes = events
            .iter()
            .filter(|e| matches!(e, VfsEvent::Write(p) | VfsEvent::Create(p) if p.ends_with("theme.liquid")))
            .count();

        assert!(writes >= 1, "expected at least one event, got {:?}", events);
    }

    #[test]
    fn watcher_critical_error_display() {
        let err = WatcherCriticalError::WatcherError {
            error: "test error".to_string(),
            path: Some(PathBuf::from("/test/path")),
        };
        assert!(err.to_string().contains("test error"));
        assert!(WatcherCriticalError::RescanRequired
            .to_string()
            .contains("rescan"));
        assert!(WatcherCriticalError::ChannelSendFailed("send failed".to_string())
            .to_string()
            .contains("send failed"));
    }
}
