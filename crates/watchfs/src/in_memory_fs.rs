use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};

use crate::{DirEntry, FsBackend, FsEvent, Metadata, ReadDir};

#[derive(Debug, Clone)]
enum Entry {
    File {
        contents: Vec<u8>,
        readonly: bool,
    },
    Dir,
}

#[derive(Debug, Clone)]
struct Node {
    entry: Entry,
    file_id: u64,
    created: i64,
    modified: i64,
}

/// A deterministic in-memory filesystem backend.
///
/// Every mutation raises the same [`FsEvent`] a real watcher would, advances
/// a logical clock used for mtimes, and assigns stable synthetic file ids
/// that survive renames. This makes observer and engine behaviour fully
/// reproducible in tests.
pub struct InMemoryFs {
    entries: BTreeMap<PathBuf, Node>,
    next_file_id: u64,
    clock: i64,
    event_sender: Sender<FsEvent>,
    event_receiver: Receiver<FsEvent>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();

        Self {
            entries: BTreeMap::new(),
            next_file_id: 1,
            clock: 1_000_000,
            event_sender,
            event_receiver,
        }
    }

    fn normalize(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn emit(&self, event: FsEvent) {
        let _ = self.event_sender.send(event);
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    fn get(&self, path: &Path) -> io::Result<&Node> {
        self.entries
            .get(&Self::normalize(path))
            .ok_or_else(|| not_found(path))
    }

    fn parent_must_be_dir(&self, path: &Path) -> io::Result<()> {
        let normalized = Self::normalize(path);
        let Some(parent) = normalized.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        match self.entries.get(parent) {
            Some(node) if matches!(node.entry, Entry::Dir) => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("Not a directory: {}", parent.display()),
            )),
            None => Err(not_found(parent)),
        }
    }

    /// Change the readonly flag of a file, raising a Rights event.
    pub fn set_readonly(&mut self, path: &Path, readonly: bool) -> io::Result<()> {
        let normalized = Self::normalize(path);
        let stamp = self.tick();
        let node = self
            .entries
            .get_mut(&normalized)
            .ok_or_else(|| not_found(path))?;

        if let Entry::File {
            readonly: flag, ..
        } = &mut node.entry
        {
            *flag = readonly;
        }
        node.modified = stamp;

        self.emit(FsEvent::Rights(normalized));
        Ok(())
    }

    /// Backdate or advance the logical clock, so tests can control mtimes.
    pub fn set_clock(&mut self, clock: i64) {
        self.clock = clock;
    }

    fn descendants_of(&self, root: &Path) -> Vec<PathBuf> {
        self.entries
            .keys()
            .filter(|candidate| candidate.starts_with(root) && candidate.as_path() != root)
            .cloned()
            .collect()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("Path not found: {}", path.display()),
    )
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsBackend for InMemoryFs {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        match &self.get(path)?.entry {
            Entry::File { contents, .. } => Ok(contents.clone()),
            Entry::Dir => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("Is a directory: {}", path.display()),
            )),
        }
    }

    fn write(&mut self, path: &Path, data: &[u8]) -> io::Result<()> {
        let normalized = Self::normalize(path);
        self.parent_must_be_dir(&normalized)?;

        let stamp = self.tick();
        match self.entries.get_mut(&normalized) {
            Some(node) => {
                match &mut node.entry {
                    Entry::File { contents, readonly } => {
                        if *readonly {
                            return Err(io::Error::new(
                                io::ErrorKind::PermissionDenied,
                                format!("Permission denied: {}", path.display()),
                            ));
                        }
                        *contents = data.to_vec();
                    }
                    Entry::Dir => {
                        return Err(io::Error::new(
                            io::ErrorKind::IsADirectory,
                            format!("Is a directory: {}", path.display()),
                        ));
                    }
                }
                node.modified = stamp;
                self.emit(FsEvent::Write(normalized));
            }
            None => {
                let file_id = self.alloc_id();
                self.entries.insert(
                    normalized.clone(),
                    Node {
                        entry: Entry::File {
                            contents: data.to_vec(),
                            readonly: false,
                        },
                        file_id,
                        created: stamp,
                        modified: stamp,
                    },
                );
                self.emit(FsEvent::Create(normalized));
            }
        }

        Ok(())
    }

    fn exists(&mut self, path: &Path) -> io::Result<bool> {
        Ok(self.entries.contains_key(&Self::normalize(path)))
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        let normalized = Self::normalize(path);
        match &self.get(&normalized)?.entry {
            Entry::Dir => {}
            Entry::File { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("Not a directory: {}", path.display()),
                ));
            }
        }

        let children: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|candidate| candidate.parent() == Some(normalized.as_path()))
            .cloned()
            .collect();

        let inner = children.into_iter().map(|path| Ok(DirEntry { path }));

        Ok(ReadDir {
            inner: Box::new(inner),
        })
    }

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        let normalized = Self::normalize(path);
        self.parent_must_be_dir(&normalized)?;

        if self.entries.contains_key(&normalized) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Already exists: {}", path.display()),
            ));
        }

        let stamp = self.tick();
        let file_id = self.alloc_id();
        self.entries.insert(
            normalized.clone(),
            Node {
                entry: Entry::Dir,
                file_id,
                created: stamp,
                modified: stamp,
            },
        );
        self.emit(FsEvent::Create(normalized));
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        let normalized = Self::normalize(path);
        let mut stack = Vec::new();
        let mut current = Some(normalized.as_path());

        while let Some(component) = current {
            if component.as_os_str().is_empty() || self.entries.contains_key(component) {
                break;
            }
            stack.push(component.to_path_buf());
            current = component.parent();
        }

        for dir in stack.into_iter().rev() {
            self.create_dir(&dir)?;
        }
        Ok(())
    }

    fn metadata(&mut self, path: &Path) -> io::Result<Metadata> {
        let node = self.get(path)?;
        let (is_file, size, readonly) = match &node.entry {
            Entry::File { contents, readonly } => (true, contents.len() as u64, *readonly),
            Entry::Dir => (false, 0, false),
        };

        Ok(Metadata {
            is_file,
            size,
            modified: node.modified,
            created: node.created,
            readonly,
            file_id: node.file_id,
        })
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        self.parent_must_be_dir(&to)?;

        if !self.entries.contains_key(&from) {
            return Err(not_found(&from));
        }

        // Move the node and every descendant, keeping file ids intact.
        let mut moved = vec![(from.clone(), to.clone())];
        for descendant in self.descendants_of(&from) {
            let suffix = descendant.strip_prefix(&from).unwrap().to_path_buf();
            moved.push((descendant, to.join(suffix)));
        }

        for (old, new) in &moved {
            if let Some(node) = self.entries.remove(old) {
                self.entries.insert(new.clone(), node);
            }
        }

        self.emit(FsEvent::Remove(from));
        self.emit(FsEvent::Create(to));
        Ok(())
    }

    fn copy(&mut self, from: &Path, to: &Path) -> io::Result<u64> {
        let contents = self.read(from)?;
        let len = contents.len() as u64;
        self.write(to, &contents)?;
        Ok(len)
    }

    fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        let normalized = Self::normalize(path);
        match self.entries.get(&normalized) {
            Some(node) if matches!(node.entry, Entry::File { .. }) => {
                self.entries.remove(&normalized);
                self.emit(FsEvent::Remove(normalized));
                Ok(())
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("Is a directory: {}", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn remove_dir_all(&mut self, path: &Path) -> io::Result<()> {
        let normalized = Self::normalize(path);
        if !self.entries.contains_key(&normalized) {
            return Err(not_found(path));
        }

        for descendant in self.descendants_of(&normalized) {
            self.entries.remove(&descendant);
        }
        self.entries.remove(&normalized);
        self.emit(FsEvent::Remove(normalized));
        Ok(())
    }

    fn canonicalize(&mut self, path: &Path) -> io::Result<PathBuf> {
        let normalized = Self::normalize(path);
        if self.entries.contains_key(&normalized) {
            Ok(normalized)
        } else {
            Err(not_found(path))
        }
    }

    fn event_receiver(&self) -> crossbeam_channel::Receiver<FsEvent> {
        self.event_receiver.clone()
    }

    fn watch(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unwatch(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_dir_all_builds_missing_parents() {
        let mut fs = InMemoryFs::new();
        fs.create_dir_all(Path::new("/a/b/c")).unwrap();

        assert!(fs.exists(Path::new("/a")).unwrap());
        assert!(fs.exists(Path::new("/a/b")).unwrap());
        assert!(fs.exists(Path::new("/a/b/c")).unwrap());
    }

    #[test]
    fn write_to_readonly_file_is_denied() {
        let mut fs = InMemoryFs::new();
        fs.create_dir_all(Path::new("/r")).unwrap();
        fs.write(Path::new("/r/a.txt"), b"x").unwrap();
        fs.set_readonly(Path::new("/r/a.txt"), true).unwrap();

        let err = fs.write(Path::new("/r/a.txt"), b"y").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn rename_moves_descendants() {
        let mut fs = InMemoryFs::new();
        fs.create_dir_all(Path::new("/r/dir")).unwrap();
        fs.write(Path::new("/r/dir/a.txt"), b"x").unwrap();

        fs.rename(Path::new("/r/dir"), Path::new("/r/moved")).unwrap();

        assert!(fs.exists(Path::new("/r/moved/a.txt")).unwrap());
        assert!(!fs.exists(Path::new("/r/dir/a.txt")).unwrap());
    }

    #[test]
    fn mtime_advances_on_write() {
        let mut fs = InMemoryFs::new();
        fs.create_dir_all(Path::new("/r")).unwrap();
        fs.write(Path::new("/r/a.txt"), b"1").unwrap();
        let before = fs.metadata(Path::new("/r/a.txt")).unwrap().modified;

        fs.write(Path::new("/r/a.txt"), b"2").unwrap();
        let after = fs.metadata(Path::new("/r/a.txt")).unwrap().modified;

        assert!(after > before);
    }
}
