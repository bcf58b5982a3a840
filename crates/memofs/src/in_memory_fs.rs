use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};

use crate::{DirEntry, Metadata, ReadDir, VfsBackend, VfsEvent};

/// In-memory filesystem that can be used as a VFS backend.
///
/// Writes and removals that land under a watched path raise the same
/// `VfsEvent`s a real watcher would, so code consuming the event stream can
/// be tested without touching disk.
///
/// The filesystem is cheap to clone; every clone shares the same contents.
/// Tests keep one clone around to simulate edits made by another process.
#[derive(Clone)]
pub struct InMemoryFs {
    inner: Arc<Mutex<InMemoryFsInner>>,
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFs {
    /// Create a new empty `InMemoryFs`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryFsInner::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryFsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place a file at the given path, creating parent directories and
    /// raising a `Create` or `Write` event as appropriate.
    pub fn load_file<P: AsRef<Path>, C: AsRef<[u8]>>(&self, path: P, contents: C) {
        let path = path.as_ref();
        let mut inner = self.lock();
        inner.ensure_parents(path);
        inner.put_file(path, contents.as_ref().to_vec());
    }

    /// Remove a file, raising a `Remove` event if it existed.
    pub fn unload_file<P: AsRef<Path>>(&self, path: P) -> bool {
        self.lock().delete_file(path.as_ref())
    }

    /// Raise an arbitrary event without touching the contents, simulating a
    /// watcher reporting a change for a file that raced with the reader.
    pub fn raise_event(&self, event: VfsEvent) {
        let _ = self.lock().sender.send(event);
    }
}

enum Entry {
    File { contents: Vec<u8> },
    Dir { children: BTreeSet<PathBuf> },
}

struct InMemoryFsInner {
    entries: BTreeMap<PathBuf, Entry>,
    watches: BTreeSet<PathBuf>,
    sender: Sender<VfsEvent>,
    receiver: Receiver<VfsEvent>,
}

impl InMemoryFsInner {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();

        Self {
            entries: BTreeMap::new(),
            watches: BTreeSet::new(),
            sender,
            receiver,
        }
    }

    fn is_watched(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| self.watches.contains(ancestor))
    }

    fn emit(&self, event: VfsEvent) {
        if self.is_watched(event.path()) {
            let _ = self.sender.send(event);
        }
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut child = path.to_path_buf();
        let mut current = path.parent();

        while let Some(parent) = current {
            if parent.as_os_str().is_empty() {
                break;
            }

            match self.entries.get_mut(parent) {
                Some(Entry::Dir { children }) => {
                    children.insert(child.clone());
                    break;
                }
                Some(Entry::File { .. }) => break,
                None => {
                    let mut children = BTreeSet::new();
                    children.insert(child.clone());
                    self.entries
                        .insert(parent.to_path_buf(), Entry::Dir { children });
                }
            }

            child = parent.to_path_buf();
            current = parent.parent();
        }
    }

    fn put_file(&mut self, path: &Path, contents: Vec<u8>) {
        let existed = matches!(self.entries.get(path), Some(Entry::File { .. }));
        self.entries
            .insert(path.to_path_buf(), Entry::File { contents });

        if existed {
            self.emit(VfsEvent::Write(path.to_path_buf()));
        } else {
            self.emit(VfsEvent::Create(path.to_path_buf()));
        }
    }

    fn delete_file(&mut self, path: &Path) -> bool {
        match self.entries.get(path) {
            Some(Entry::File { .. }) => {}
            _ => return false,
        }

        self.entries.remove(path);

        if let Some(parent) = path.parent() {
            if let Some(Entry::Dir { children }) = self.entries.get_mut(parent) {
                children.remove(path);
            }
        }

        self.emit(VfsEvent::Remove(path.to_path_buf()));
        true
    }
}

impl VfsBackend for InMemoryFs {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        match self.lock().entries.get(path) {
            Some(Entry::File { contents }) => Ok(contents.clone()),
            Some(Entry::Dir { .. }) => must_be_file(path),
            None => not_found(path),
        }
    }

    fn write(&mut self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();

        if let Some(Entry::Dir { .. }) = inner.entries.get(path) {
            return must_be_file(path);
        }

        inner.ensure_parents(path);
        inner.put_file(path, data.to_vec());
        Ok(())
    }

    fn exists(&mut self, path: &Path) -> io::Result<bool> {
        Ok(self.lock().entries.contains_key(path))
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        match self.lock().entries.get(path) {
            Some(Entry::Dir { children }) => {
                let iter = children
                    .clone()
                    .into_iter()
                    .map(|path| Ok(DirEntry { path }));

                Ok(ReadDir {
                    inner: Box::new(iter),
                })
            }
            Some(Entry::File { .. }) => must_be_dir(path),
            None => not_found(path),
        }
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        let mut inner = self.lock();

        match inner.entries.get(path) {
            Some(Entry::Dir { .. }) => return Ok(()),
            Some(Entry::File { .. }) => return must_be_dir(path),
            None => {}
        }

        inner.ensure_parents(path);
        inner.entries.insert(
            path.to_path_buf(),
            Entry::Dir {
                children: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn metadata(&mut self, path: &Path) -> io::Result<Metadata> {
        match self.lock().entries.get(path) {
            Some(Entry::File { contents }) => Ok(Metadata {
                is_file: true,
                len: contents.len() as u64,
            }),
            Some(Entry::Dir { .. }) => Ok(Metadata {
                is_file: false,
                len: 0,
            }),
            None => not_found(path),
        }
    }

    fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        let mut inner = self.lock();

        match inner.entries.get(path) {
            Some(Entry::File { .. }) => {
                inner.delete_file(path);
                Ok(())
            }
            Some(Entry::Dir { .. }) => must_be_file(path),
            None => not_found(path),
        }
    }

    fn event_receiver(&self) -> Receiver<VfsEvent> {
        self.lock().receiver.clone()
    }

    fn watch(&mut self, path: &Path) -> io::Result<()> {
        self.lock().watches.insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> io::Result<()> {
        self.lock().watches.remove(path);
        Ok(())
    }
}

fn must_be_file<T>(path: &Path) -> io::Result<T> {
    Err(io::Error::other(format!(
        "path {} was a directory, but must be a file",
        path.display()
    )))
}

fn must_be_dir<T>(path: &Path) -> io::Result<T> {
    Err(io::Error::other(format!(
        "path {} was a file, but must be a directory",
        path.display()
    )))
}

fn not_found<T>(path: &Path) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("path {} not found", path.display()),
    ))
}
