/*!
Implementation of a virtual filesystem with a configurable backend and file
watching.

memofs is the filesystem layer underneath themesync's local theme index. Every
read, write and removal of a theme file goes through a [`Vfs`], which makes
the sync engine testable without touching disk and gives it a single stream
of change events regardless of backend.

## Backends
* `StdBackend`, which uses `std::fs` and the `notify` crate with a debouncer
* `InMemoryFs`, an in-memory filesystem that raises the same events a real
  watcher would, useful for testing
*/

mod in_memory_fs;
mod std_backend;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use in_memory_fs::InMemoryFs;
pub use std_backend::{CriticalErrorHandler, StdBackend, WatcherCriticalError};

/// Debounce window applied to raw watcher events when none is configured.
/// Editors commonly touch a file twice on save; 50ms collapses those.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

mod sealed {
    use super::*;

    /// Sealing trait for VfsBackend.
    pub trait Sealed {}

    impl Sealed for StdBackend {}
    impl Sealed for InMemoryFs {}
}

/// Trait that transforms `io::Result<T>` into `io::Result<Option<T>>`.
///
/// `Ok(None)` takes the place of IO errors whose `io::ErrorKind` is `NotFound`.
pub trait IoResultExt<T> {
    fn with_not_found(self) -> io::Result<Option<T>>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_not_found(self) -> io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Backend that can be used to create a `Vfs`.
///
/// This trait is sealed and cannot not be implemented outside this crate.
pub trait VfsBackend: sealed::Sealed + Send + 'static {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&mut self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn exists(&mut self, path: &Path) -> io::Result<bool>;
    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir>;
    fn create_dir_all(&mut self, path: &Path) -> io::Result<()>;
    fn metadata(&mut self, path: &Path) -> io::Result<Metadata>;
    fn remove_file(&mut self, path: &Path) -> io::Result<()>;

    fn event_receiver(&self) -> crossbeam_channel::Receiver<VfsEvent>;
    fn watch(&mut self, path: &Path) -> io::Result<()>;
    fn unwatch(&mut self, path: &Path) -> io::Result<()>;
}

/// Vfs equivalent to [`std::fs::DirEntry`][std::fs::DirEntry].
///
/// [std::fs::DirEntry]: https://doc.rust-lang.org/stable/std/fs/struct.DirEntry.html
pub struct DirEntry {
    pub(crate) path: PathBuf,
}

impl DirEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Vfs equivalent to [`std::fs::ReadDir`][std::fs::ReadDir].
///
/// [std::fs::ReadDir]: https://doc.rust-lang.org/stable/std/fs/struct.ReadDir.html
pub struct ReadDir {
    pub(crate) inner: Box<dyn Iterator<Item = io::Result<DirEntry>>>,
}

impl Iterator for ReadDir {
    type Item = io::Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Vfs equivalent to [`std::fs::Metadata`][std::fs::Metadata].
///
/// [std::fs::Metadata]: https://doc.rust-lang.org/stable/std/fs/struct.Metadata.html
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub(crate) is_file: bool,
    pub(crate) len: u64,
}

impl Metadata {
    pub fn is_file(&self) -> bool {
        self.is_file
    }

    pub fn is_dir(&self) -> bool {
        !self.is_file
    }

    /// Size of the file in bytes. Always zero for directories.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Represents an event that a filesystem can raise that might need to be
/// handled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VfsEvent {
    Create(PathBuf),
    Write(PathBuf),
    Remove(PathBuf),
}

impl VfsEvent {
    pub fn path(&self) -> &Path {
        match self {
            VfsEvent::Create(path) | VfsEvent::Write(path) | VfsEvent::Remove(path) => path,
        }
    }
}

/// Contains implementation details of the Vfs, wrapped by `Vfs`.
struct VfsInner {
    backend: Box<dyn VfsBackend>,
}

impl VfsInner {
    fn read(&mut self, path: &Path) -> io::Result<Arc<Vec<u8>>> {
        let contents = self.backend.read(path)?;
        Ok(Arc::new(contents))
    }

    fn write(&mut self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !self.backend.exists(parent)? {
                self.backend.create_dir_all(parent)?;
            }
        }

        self.backend.write(path, contents)
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        self.backend.read_dir(path)
    }

    fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        self.backend.remove_file(path)
    }

    fn watch(&mut self, path: &Path) -> io::Result<()> {
        self.backend.watch(path)
    }
}

/// A virtual filesystem with a configurable backend.
///
/// All operations on the Vfs take a lock on an internal backend. For
/// performance-sensitive batches, hold a reference and call methods in a
/// loop instead of re-fetching the `Vfs`.
pub struct Vfs {
    inner: Mutex<VfsInner>,
}

impl Vfs {
    /// Creates a new `Vfs` backed by the real filesystem with a custom debounce
    /// window, along with the receiver for watcher failures.
    pub fn new_default_with_errors(
        debounce: Duration,
    ) -> (Self, crossbeam_channel::Receiver<WatcherCriticalError>) {
        let backend = StdBackend::with_debounce(debounce);
        let errors = backend.critical_error_receiver();
        (Self::new(backend), errors)
    }

    /// Creates a new `Vfs` with the given backend.
    pub fn new<B: VfsBackend>(backend: B) -> Self {
        let lock = VfsInner {
            backend: Box::new(backend),
        };

        Self {
            inner: Mutex::new(lock),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VfsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a file from the VFS, or the underlying backend if it isn't
    /// resident.
    ///
    /// Roughly equivalent to [`std::fs::read`][std::fs::read].
    ///
    /// [std::fs::read]: https://doc.rust-lang.org/stable/std/fs/fn.read.html
    pub fn read<P: AsRef<Path>>(&self, path: P) -> io::Result<Arc<Vec<u8>>> {
        self.lock().read(path.as_ref())
    }

    /// Write a file to the VFS and the underlying backend, creating missing
    /// parent directories first.
    ///
    /// Roughly equivalent to [`std::fs::write`][std::fs::write].
    ///
    /// [std::fs::write]: https://doc.rust-lang.org/stable/std/fs/fn.write.html
    pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(&self, path: P, contents: C) -> io::Result<()> {
        self.lock().write(path.as_ref(), contents.as_ref())
    }

    /// Read all of the children of a directory.
    ///
    /// Roughly equivalent to [`std::fs::read_dir`][std::fs::read_dir].
    ///
    /// [std::fs::read_dir]: https://doc.rust-lang.org/stable/std/fs/fn.read_dir.html
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<ReadDir> {
        self.lock().read_dir(path.as_ref())
    }

    /// Remove a file.
    ///
    /// Roughly equivalent to [`std::fs::remove_file`][std::fs::remove_file].
    ///
    /// [std::fs::remove_file]: https://doc.rust-lang.org/stable/std/fs/fn.remove_file.html
    pub fn remove_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.lock().remove_file(path.as_ref())
    }

    /// Query metadata about the given path.
    ///
    /// Roughly equivalent to [`std::fs::metadata`][std::fs::metadata].
    ///
    /// [std::fs::metadata]: https://doc.rust-lang.org/stable/std/fs/fn.metadata.html
    pub fn metadata<P: AsRef<Path>>(&self, path: P) -> io::Result<Metadata> {
        self.lock().backend.metadata(path.as_ref())
    }

    /// Start watching the given path (recursively) for changes. Events show up
    /// on [`Vfs::event_receiver`].
    pub fn watch<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.lock().watch(path.as_ref())
    }

    /// Retrieve a handle to the event receiver for this `Vfs`.
    pub fn event_receiver(&self) -> crossbeam_channel::Receiver<VfsEvent> {
        self.lock().backend.event_receiver()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_creates_missing_parents() {
        let fs = InMemoryFs::new();
        let vfs = Vfs::new(fs.clone());

        vfs.write("/theme/sections/header.liquid", "<header>")
            .unwrap();

        assert!(vfs.metadata("/theme/sections").unwrap().is_dir());
        assert_eq!(
            vfs.read("/theme/sections/header.liquid").unwrap().as_slice(),
            b"<header>"
        );
    }

    #[test]
    fn with_not_found_maps_missing_files_to_none() {
        let vfs = Vfs::new(InMemoryFs::new());

        let contents = vfs.read("/nowhere.json").with_not_found().unwrap();
        assert!(contents.is_none());
    }

    #[test]
    fn read_dir_lists_direct_children_only() {
        let fs = InMemoryFs::new();
        let vfs = Vfs::new(fs.clone());
        vfs.write("/theme/templates/index.json", "{}").unwrap();
        vfs.write("/theme/templates/customers/account.json", "{}")
            .unwrap();

        let mut children: Vec<PathBuf> = vfs
            .read_dir("/theme/templates")
            .unwrap()
            .map(|entry| entry.unwrap().path().to_path_buf())
            .collect();
        children.sort();

        assert_eq!(
            children,
            vec![
                PathBuf::from("/theme/templates/customers"),
                PathBuf::from("/theme/templates/index.json"),
            ]
        );
    }

    #[test]
    fn metadata_reports_length() {
        let vfs = Vfs::new(InMemoryFs::new());
        vfs.write("/theme/assets/app.js", "let a = 1;").unwrap();

        let meta = vfs.metadata("/theme/assets/app.js").unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 10);
    }
}
