//! The local half of a theme: an index of every syncable file under the
//! theme root, kept current by a file watcher.
//!
//! `ThemeFileSystem` is the only writer of that index. The reconciler and the
//! uploader go through `write`/`delete`, the watcher thread goes through the
//! same bookkeeping, and everyone else reads. Every mutation produces a
//! `ThemeFsEvent` that is debounced per key and then handed to the
//! registered listeners in write order.

mod debounce;
mod watcher;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use memofs::{IoResultExt, Vfs};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::checksum::{compute_checksum, Key};
use crate::glob::FileFilter;
use crate::theme_api::{ApiError, ThemeAsset};

use self::debounce::Debouncer;
use self::watcher::WatchProcessor;

/// Top-level directories a theme is made of. Scanning never leaves them.
pub const THEME_DIRECTORIES: &[&str] = &[
    "assets",
    "blocks",
    "config",
    "layout",
    "locales",
    "sections",
    "snippets",
    "templates",
];

/// Who caused a write. Remote-origin writes are never uploaded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    LocalEdit,
    RemoteSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThemeFsEventKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeFsEvent {
    pub kind: ThemeFsEventKind,
    pub key: Key,
    pub origin: Origin,
    /// The platform checksum, for remote-origin writes.
    pub checksum: Option<String>,
}

/// A file as the rest of the engine sees it. A file without a checksum has
/// local content that the platform has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeFile {
    pub key: Key,
    pub checksum: Option<String>,
}

/// One local file as the reconciler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileState {
    pub key: Key,
    /// Checksum to compare against the remote snapshot.
    pub checksum: String,
    pub created_in_session: bool,
}

/// The local side of a reconciliation pass, captured under a single lock.
/// `unsynced` also holds keys whose local deletion is not uploaded yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub files: Vec<LocalFileState>,
    pub unsynced: BTreeSet<Key>,
}

#[derive(Debug, Error)]
pub enum ThemeFsError {
    #[error("{key} is not part of the local theme")]
    NotFound { key: Key },

    #[error("{key} is excluded by the ignore/only filters")]
    Filtered { key: Key },

    #[error("{key} has a local edit that has not been uploaded yet")]
    PendingLocalEdit { key: Key },

    #[error("could not read theme directory {}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Asset(#[from] ApiError),

    #[error("initial theme scan did not finish: {0}")]
    ScanTask(String),
}

/// Internal index record. `fingerprint` is the MD5 of what is on disk;
/// `checksum` is what the platform is believed to hold for that content.
#[derive(Debug, Clone)]
struct IndexEntry {
    fingerprint: String,
    checksum: Option<String>,
    size: u64,
}

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<Key, IndexEntry>,
    unsynced: BTreeSet<Key>,
    created_in_session: BTreeSet<Key>,
    scanned: bool,
}

type ChangeListener = Arc<dyn Fn(&ThemeFsEvent) + Send + Sync>;

/// State shared between handles and the watcher thread. The thread only
/// ever holds this, never a `ThemeFileSystem`, so dropping the last handle
/// always happens off the watcher thread.
struct Shared {
    root: PathBuf,
    vfs: Arc<Vfs>,
    filter: Arc<FileFilter>,
    debounce: Duration,
    state: Mutex<IndexState>,
    debouncer: Mutex<Debouncer>,
    listeners: RwLock<Vec<ChangeListener>>,
    ready: OnceCell<()>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.split('/'));
        path
    }

    fn key_for(&self, path: &Path) -> Option<Key> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Indexed keys strictly below the directory `key`.
    fn keys_under(&self, key: &str) -> Vec<Key> {
        let prefix = format!("{key}/");
        self.lock_state()
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn queue(&self, event: ThemeFsEvent) {
        self.debouncer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event, Instant::now());
    }

    fn flush_due(&self, now: Instant) {
        let due = self
            .debouncer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_due(now);

        if due.is_empty() {
            return;
        }

        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for event in &due {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn scan(&self) -> Result<(), ThemeFsError> {
        // A theme root that cannot be listed is fatal; a missing theme
        // subdirectory is not.
        self.vfs
            .read_dir(&self.root)
            .map_err(|source| ThemeFsError::Scan {
                path: self.root.clone(),
                source,
            })?;

        let mut found = BTreeMap::new();
        for directory in THEME_DIRECTORIES {
            self.scan_dir(&self.root.join(directory), &mut found)?;
        }

        let mut state = self.lock_state();
        state.entries = found;
        state.scanned = true;

        log::debug!("Indexed {} theme files", state.entries.len());
        Ok(())
    }

    fn scan_dir(
        &self,
        dir: &Path,
        found: &mut BTreeMap<Key, IndexEntry>,
    ) -> Result<(), ThemeFsError> {
        let entries = match self.vfs.read_dir(dir).with_not_found() {
            Ok(Some(entries)) => entries,
            Ok(None) => return Ok(()),
            Err(source) => {
                return Err(ThemeFsError::Scan {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| ThemeFsError::Scan {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();

            let metadata = match self.vfs.metadata(path).with_not_found() {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(source) => {
                    return Err(ThemeFsError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            };

            if metadata.is_dir() {
                self.scan_dir(path, found)?;
                continue;
            }

            let Some(key) = self.key_for(path) else {
                continue;
            };
            if !self.filter.accepts(&key) {
                log::trace!("Skipping filtered file {key}");
                continue;
            }

            let contents = match self.vfs.read(path).with_not_found() {
                Ok(Some(contents)) => contents,
                Ok(None) => continue,
                Err(source) => {
                    return Err(ThemeFsError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            };

            let fingerprint = compute_checksum(&contents);
            found.insert(
                key,
                IndexEntry {
                    checksum: Some(fingerprint.clone()),
                    fingerprint,
                    size: contents.len() as u64,
                },
            );
        }

        Ok(())
    }
}

/// Handle to the local theme. Cheap to clone; all clones share one index and
/// one watcher thread, which stops when the last handle is dropped or
/// `shutdown` is called.
#[derive(Clone)]
pub struct ThemeFileSystem {
    shared: Arc<Shared>,
    watcher: Arc<Mutex<Option<WatchProcessor>>>,
}

impl ThemeFileSystem {
    pub fn new(root: PathBuf, vfs: Arc<Vfs>, filter: Arc<FileFilter>, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                root,
                vfs,
                filter,
                debounce,
                state: Mutex::new(IndexState::default()),
                debouncer: Mutex::new(Debouncer::new(debounce)),
                listeners: RwLock::new(Vec::new()),
                ready: OnceCell::new(),
            }),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Scans the theme root once and starts watching it. Resolves when the
    /// index is complete; later calls return immediately.
    pub async fn ready(&self) -> Result<(), ThemeFsError> {
        self.shared
            .ready
            .get_or_try_init(|| async {
                let shared = Arc::clone(&self.shared);

                if let Err(err) = shared.vfs.watch(&shared.root) {
                    log::warn!(
                        "Could not watch {}: {}. Local edits will not be picked up.",
                        shared.root.display(),
                        err
                    );
                }

                let scanned = Arc::clone(&shared);
                tokio::task::spawn_blocking(move || scanned.scan())
                    .await
                    .map_err(|err| ThemeFsError::ScanTask(err.to_string()))??;

                let processor =
                    WatchProcessor::start(shared).map_err(|source| ThemeFsError::Io {
                        path: self.shared.root.clone(),
                        source,
                    })?;
                *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(processor);

                Ok::<(), ThemeFsError>(())
            })
            .await
            .map(|_| ())
    }

    /// Stops the watcher thread after delivering pending notifications.
    pub fn shutdown(&self) {
        let processor = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(processor);
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn filter(&self) -> &Arc<FileFilter> {
        &self.shared.filter
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.shared.path_for(key)
    }

    /// Registers a change listener. Listeners run on the watcher thread and
    /// must not block.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&ThemeFsEvent) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    pub fn read(&self, key: &str) -> Result<Arc<Vec<u8>>, ThemeFsError> {
        if !self.contains(key) {
            return Err(ThemeFsError::NotFound { key: key.to_owned() });
        }

        let path = self.path_for(key);
        match self.shared.vfs.read(&path).with_not_found() {
            Ok(Some(contents)) => Ok(contents),
            Ok(None) => Err(ThemeFsError::NotFound { key: key.to_owned() }),
            Err(source) => Err(ThemeFsError::Io { path, source }),
        }
    }

    /// Writes a file and records it in the index.
    pub fn write(&self, key: &str, contents: &[u8], origin: Origin) -> Result<(), ThemeFsError> {
        self.write_inner(key, contents, origin, None)
    }

    /// Writes a downloaded asset, remembering the checksum the platform
    /// reported for it. Refuses keys with an unuploaded local edit.
    pub fn apply_remote(&self, asset: &ThemeAsset) -> Result<(), ThemeFsError> {
        let contents = asset.content_bytes()?;
        self.write_inner(
            &asset.key,
            &contents,
            Origin::RemoteSync,
            asset.checksum.clone(),
        )
    }

    fn write_inner(
        &self,
        key: &str,
        contents: &[u8],
        origin: Origin,
        remote_checksum: Option<String>,
    ) -> Result<(), ThemeFsError> {
        if !self.shared.filter.accepts(key) {
            return Err(ThemeFsError::Filtered { key: key.to_owned() });
        }

        let fingerprint = compute_checksum(contents);
        let path = self.path_for(key);

        let event = {
            let mut state = self.shared.lock_state();

            if origin == Origin::RemoteSync && state.unsynced.contains(key) {
                return Err(ThemeFsError::PendingLocalEdit { key: key.to_owned() });
            }

            self.shared
                .vfs
                .write(&path, contents)
                .map_err(|source| ThemeFsError::Io {
                    path: path.clone(),
                    source,
                })?;

            let existed = state.entries.contains_key(key);
            let checksum = match origin {
                Origin::RemoteSync => Some(remote_checksum.unwrap_or_else(|| fingerprint.clone())),
                Origin::LocalEdit => None,
            };

            state.entries.insert(
                key.to_owned(),
                IndexEntry {
                    fingerprint,
                    checksum: checksum.clone(),
                    size: contents.len() as u64,
                },
            );

            if origin == Origin::LocalEdit {
                state.unsynced.insert(key.to_owned());
                if !existed && state.scanned {
                    state.created_in_session.insert(key.to_owned());
                }
            }

            ThemeFsEvent {
                kind: if existed {
                    ThemeFsEventKind::Change
                } else {
                    ThemeFsEventKind::Add
                },
                key: key.to_owned(),
                origin,
                checksum,
            }
        };

        self.shared.queue(event);
        Ok(())
    }

    /// Removes a file from disk and from the index.
    pub fn delete(&self, key: &str, origin: Origin) -> Result<(), ThemeFsError> {
        let path = self.path_for(key);

        {
            let mut state = self.shared.lock_state();

            if origin == Origin::RemoteSync && state.unsynced.contains(key) {
                return Err(ThemeFsError::PendingLocalEdit { key: key.to_owned() });
            }

            if state.entries.remove(key).is_none() {
                return Err(ThemeFsError::NotFound { key: key.to_owned() });
            }
            state.created_in_session.remove(key);

            if origin == Origin::LocalEdit {
                state.unsynced.insert(key.to_owned());
            }

            if let Err(source) = self.shared.vfs.remove_file(&path).with_not_found() {
                return Err(ThemeFsError::Io { path, source });
            }
        }

        self.shared.queue(ThemeFsEvent {
            kind: ThemeFsEventKind::Unlink,
            key: key.to_owned(),
            origin,
            checksum: None,
        });
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.filter.accepts(key) && self.shared.lock_state().entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<ThemeFile> {
        self.shared
            .lock_state()
            .entries
            .get(key)
            .map(|entry| ThemeFile {
                key: key.to_owned(),
                checksum: entry.checksum.clone(),
            })
    }

    /// Size in bytes of an indexed file.
    pub fn stat(&self, key: &str) -> Option<u64> {
        self.shared.lock_state().entries.get(key).map(|entry| entry.size)
    }

    pub fn files(&self) -> Vec<ThemeFile> {
        self.shared
            .lock_state()
            .entries
            .iter()
            .map(|(key, entry)| ThemeFile {
                key: key.clone(),
                checksum: entry.checksum.clone(),
            })
            .collect()
    }

    pub fn local_snapshot(&self) -> LocalSnapshot {
        let state = self.shared.lock_state();
        let files = state
            .entries
            .iter()
            .map(|(key, entry)| LocalFileState {
                key: key.clone(),
                checksum: entry
                    .checksum
                    .clone()
                    .unwrap_or_else(|| entry.fingerprint.clone()),
                created_in_session: state.created_in_session.contains(key),
            })
            .collect();

        LocalSnapshot {
            files,
            unsynced: state.unsynced.clone(),
        }
    }

    /// Keys with a local change (edit or deletion) the platform has not
    /// confirmed yet.
    pub fn unsynced_keys(&self) -> BTreeSet<Key> {
        self.shared.lock_state().unsynced.clone()
    }

    pub fn is_unsynced(&self, key: &str) -> bool {
        self.shared.lock_state().unsynced.contains(key)
    }

    pub fn is_created_in_session(&self, key: &str) -> bool {
        self.shared.lock_state().created_in_session.contains(key)
    }

    /// Confirms an upload of the content with the given fingerprint. Ignored
    /// when the file changed again since it was read for upload. A file
    /// created this session stays marked as such; a snapshot fetched before
    /// the upload landed must still not delete it.
    pub fn mark_uploaded(&self, key: &str, fingerprint: &str, remote_checksum: Option<String>) {
        let mut state = self.shared.lock_state();

        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.fingerprint != fingerprint {
            return;
        }

        entry.checksum = Some(remote_checksum.unwrap_or_else(|| fingerprint.to_owned()));
        state.unsynced.remove(key);
    }

    /// Confirms a remote deletion. Ignored when the file was recreated.
    pub fn mark_deleted_remotely(&self, key: &str) {
        let mut state = self.shared.lock_state();
        if !state.entries.contains_key(key) {
            state.unsynced.remove(key);
        }
    }

    /// Fingerprint of the content currently indexed for `key`.
    pub fn fingerprint(&self, key: &str) -> Option<String> {
        self.shared
            .lock_state()
            .entries
            .get(key)
            .map(|entry| entry.fingerprint.clone())
    }
}
