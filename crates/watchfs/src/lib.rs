/*!
Filesystem access layer with a configurable backend and file watching.

watchfs is the layer a sync engine's local observer sits on. It exposes an
API similar to `std::fs` plus a change-event channel, with two backends:

* `StdBackend`, which uses `std::fs` and the `notify` crate
* `InMemoryFs`, a deterministic in-memory filesystem useful for testing

Unlike plain `std::fs`, `metadata()` returns the fields a sync engine diffs
on: a stable per-file id, size, modification and creation times, and whether
the file is writable.
*/

mod in_memory_fs;
mod std_backend;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::{io, str};

pub use in_memory_fs::InMemoryFs;
pub use std_backend::{StdBackend, WatcherFault};

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

/// Backend that can be used to create an [`Fs`].
pub trait FsBackend: Send + 'static {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&mut self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn exists(&mut self, path: &Path) -> io::Result<bool>;
    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir>;
    fn create_dir(&mut self, path: &Path) -> io::Result<()>;
    fn create_dir_all(&mut self, path: &Path) -> io::Result<()>;
    fn metadata(&mut self, path: &Path) -> io::Result<Metadata>;
    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()>;
    fn copy(&mut self, from: &Path, to: &Path) -> io::Result<u64>;
    fn remove_file(&mut self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&mut self, path: &Path) -> io::Result<()>;
    fn canonicalize(&mut self, path: &Path) -> io::Result<PathBuf>;

    fn event_receiver(&self) -> crossbeam_channel::Receiver<FsEvent>;
    fn watch(&mut self, path: &Path) -> io::Result<()>;
    fn unwatch(&mut self, path: &Path) -> io::Result<()>;
}

/// Equivalent to [`std::fs::DirEntry`].
pub struct DirEntry {
    pub(crate) path: PathBuf,
}

impl DirEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Equivalent to [`std::fs::ReadDir`].
pub struct ReadDir {
    pub(crate) inner: Box<dyn Iterator<Item = io::Result<DirEntry>>>,
}

impl Iterator for ReadDir {
    type Item = io::Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Stat result carrying everything a sync engine needs to diff an item.
///
/// Times are in whole seconds since the Unix epoch. `file_id` is stable for
/// the life of the underlying file (inode number on Unix) and survives
/// renames, which is what lets the engine tell a Move apart from a
/// Delete + Create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub is_file: bool,
    pub size: u64,
    pub modified: i64,
    pub created: i64,
    pub readonly: bool,
    pub file_id: u64,
}

impl Metadata {
    pub fn is_file(&self) -> bool {
        self.is_file
    }

    pub fn is_dir(&self) -> bool {
        !self.is_file
    }
}

/// An event raised by a filesystem backend that the observer may need to
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FsEvent {
    Create(PathBuf),
    Write(PathBuf),
    Remove(PathBuf),
    /// Permission or ownership change. The path may or may not still exist.
    Rights(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Create(path)
            | FsEvent::Write(path)
            | FsEvent::Remove(path)
            | FsEvent::Rights(path) => path,
        }
    }
}

struct FsInner {
    backend: Box<dyn FsBackend>,
    watch_enabled: bool,
}

impl FsInner {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        let contents = self.backend.read(path)?;

        if self.watch_enabled {
            self.backend.watch(path)?;
        }

        Ok(contents)
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        let dir = self.backend.read_dir(path)?;

        if self.watch_enabled {
            self.backend.watch(path)?;
        }

        Ok(dir)
    }
}

/// A filesystem handle with a configurable backend.
///
/// All operations take a lock on the internal backend. For large batches of
/// operations, call [`Fs::lock`] and use [`FsLock`] instead.
pub struct Fs {
    inner: Mutex<FsInner>,
}

impl Fs {
    /// Creates a new `Fs` with the default backend, `StdBackend`.
    pub fn new_default() -> Self {
        Self::new(StdBackend::new())
    }

    /// Creates a new `Fs` with the given backend.
    pub fn new<B: FsBackend>(backend: B) -> Self {
        let inner = FsInner {
            backend: Box::new(backend),
            watch_enabled: true,
        };

        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Manually lock the `Fs`, useful for large batches of operations.
    pub fn lock(&self) -> FsLock<'_> {
        FsLock {
            inner: self.inner.lock().unwrap(),
        }
    }

    /// Turns automatic file watching on or off. Enabled by default.
    pub fn set_watch_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.watch_enabled = enabled;
    }

    /// Read a file's contents. Registers a watch on the path when watching
    /// is enabled.
    #[inline]
    pub fn read<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<u8>> {
        self.inner.lock().unwrap().read(path.as_ref())
    }

    /// Read a file's contents into a string.
    #[inline]
    pub fn read_to_string<P: AsRef<Path>>(&self, path: P) -> io::Result<String> {
        let path = path.as_ref();
        let contents = self.inner.lock().unwrap().read(path)?;

        String::from_utf8(contents).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("File was not valid UTF-8: {}", path.display()),
            )
        })
    }

    /// Write a file's contents.
    #[inline]
    pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(&self, path: P, contents: C) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .write(path.as_ref(), contents.as_ref())
    }

    /// Read all of the children of a directory, sorted by file name.
    #[inline]
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<ReadDir> {
        self.inner.lock().unwrap().read_dir(path.as_ref())
    }

    /// Return whether the given path exists.
    #[inline]
    pub fn exists<P: AsRef<Path>>(&self, path: P) -> io::Result<bool> {
        self.inner.lock().unwrap().backend.exists(path.as_ref())
    }

    /// Creates a directory. Fails if the parent does not exist.
    #[inline]
    pub fn create_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner.lock().unwrap().backend.create_dir(path.as_ref())
    }

    /// Creates a directory and any missing parents.
    #[inline]
    pub fn create_dir_all<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .create_dir_all(path.as_ref())
    }

    /// Rename a file or directory, replacing the destination if present.
    #[inline]
    pub fn rename<P: AsRef<Path>, Q: AsRef<Path>>(&self, from: P, to: Q) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .rename(from.as_ref(), to.as_ref())
    }

    /// Copy a file's contents to a new path, returning the number of bytes
    /// copied. The destination keeps its own identity if it already exists.
    #[inline]
    pub fn copy<P: AsRef<Path>, Q: AsRef<Path>>(&self, from: P, to: Q) -> io::Result<u64> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .copy(from.as_ref(), to.as_ref())
    }

    /// Remove a file.
    #[inline]
    pub fn remove_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .remove_file(path.as_ref())
    }

    /// Remove a directory and all of its descendants.
    #[inline]
    pub fn remove_dir_all<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .remove_dir_all(path.as_ref())
    }

    /// Query metadata about the given path.
    #[inline]
    pub fn metadata<P: AsRef<Path>>(&self, path: P) -> io::Result<Metadata> {
        self.inner.lock().unwrap().backend.metadata(path.as_ref())
    }

    /// Normalize a path via the underlying backend.
    #[inline]
    pub fn canonicalize<P: AsRef<Path>>(&self, path: P) -> io::Result<PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .backend
            .canonicalize(path.as_ref())
    }

    /// Start watching a path (recursively for directories).
    #[inline]
    pub fn watch<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner.lock().unwrap().backend.watch(path.as_ref())
    }

    /// Stop watching a path.
    #[inline]
    pub fn unwatch<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.inner.lock().unwrap().backend.unwatch(path.as_ref())
    }

    /// Retrieve a handle to the event receiver for this `Fs`.
    #[inline]
    pub fn event_receiver(&self) -> crossbeam_channel::Receiver<FsEvent> {
        self.inner.lock().unwrap().backend.event_receiver()
    }
}

/// A locked handle to an [`Fs`], created by [`Fs::lock`].
pub struct FsLock<'a> {
    inner: MutexGuard<'a, FsInner>,
}

impl FsLock<'_> {
    pub fn set_watch_enabled(&mut self, enabled: bool) {
        self.inner.watch_enabled = enabled;
    }

    #[inline]
    pub fn read<P: AsRef<Path>>(&mut self, path: P) -> io::Result<Vec<u8>> {
        self.inner.read(path.as_ref())
    }

    #[inline]
    pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(
        &mut self,
        path: P,
        contents: C,
    ) -> io::Result<()> {
        self.inner.backend.write(path.as_ref(), contents.as_ref())
    }

    #[inline]
    pub fn read_dir<P: AsRef<Path>>(&mut self, path: P) -> io::Result<ReadDir> {
        self.inner.read_dir(path.as_ref())
    }

    #[inline]
    pub fn metadata<P: AsRef<Path>>(&mut self, path: P) -> io::Result<Metadata> {
        self.inner.backend.metadata(path.as_ref())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_not_found_maps_missing_to_none() {
        let missing: io::Result<u8> = Err(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.with_not_found().unwrap(), None);

        let denied: io::Result<u8> = Err(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(denied.with_not_found().is_err());

        let ok: io::Result<u8> = Ok(7);
        assert_eq!(ok.with_not_found().unwrap(), Some(7));
    }

    #[test]
    fn in_memory_read_write_round_trip() {
        let fs = Fs::new(InMemoryFs::new());
        fs.create_dir_all("/root/sub").unwrap();
        fs.write("/root/sub/a.txt", b"hello").unwrap();

        assert_eq!(fs.read("/root/sub/a.txt").unwrap(), b"hello");
        assert!(fs.exists("/root/sub/a.txt").unwrap());

        let meta = fs.metadata("/root/sub/a.txt").unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 5);
    }

    #[test]
    fn in_memory_rename_keeps_file_id() {
        let fs = Fs::new(InMemoryFs::new());
        fs.create_dir_all("/root").unwrap();
        fs.write("/root/a.txt", b"x").unwrap();

        let before = fs.metadata("/root/a.txt").unwrap();
        fs.rename("/root/a.txt", "/root/b.txt").unwrap();
        let after = fs.metadata("/root/b.txt").unwrap();

        assert_eq!(before.file_id, after.file_id);
        assert!(!fs.exists("/root/a.txt").unwrap());
    }

    #[test]
    fn in_memory_copy_assigns_new_file_id() {
        let fs = Fs::new(InMemoryFs::new());
        fs.create_dir_all("/root").unwrap();
        fs.write("/root/a.txt", b"abc").unwrap();

        let copied = fs.copy("/root/a.txt", "/root/b.txt").unwrap();
        assert_eq!(copied, 3);

        let a = fs.metadata("/root/a.txt").unwrap();
        let b = fs.metadata("/root/b.txt").unwrap();
        assert_ne!(a.file_id, b.file_id);
        assert_eq!(fs.read("/root/b.txt").unwrap(), b"abc");
    }

    #[test]
    fn in_memory_events_are_raised_for_mutations() {
        let fs = Fs::new(InMemoryFs::new());
        let events = fs.event_receiver();

        fs.create_dir_all("/root").unwrap();
        fs.write("/root/a.txt", b"1").unwrap();
        fs.write("/root/a.txt", b"22").unwrap();
        fs.remove_file("/root/a.txt").unwrap();

        let collected: Vec<FsEvent> = events.try_iter().collect();
        assert!(collected.contains(&FsEvent::Create(PathBuf::from("/root/a.txt"))));
        assert!(collected.contains(&FsEvent::Write(PathBuf::from("/root/a.txt"))));
        assert!(collected.contains(&FsEvent::Remove(PathBuf::from("/root/a.txt"))));
    }
}
