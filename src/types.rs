//! Core identifiers and enumerations shared across the engine.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Opaque identifier unique within one replica: an inode-derived id on the
/// local side, the drive's file id on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Integer primary key in the local sync database.
pub type DbNodeId = i64;

/// Seconds since the Unix epoch.
pub type SyncTime = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
    #[default]
    Unknown,
}

impl NodeType {
    pub fn is_directory(&self) -> bool {
        matches!(self, NodeType::Directory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkType {
    #[default]
    None,
    Symlink,
    Hardlink,
    Junction,
    FinderAlias,
}

impl LinkType {
    /// Sentinel MIME types the drive uses to mark link objects; the body of
    /// such a download is the link target path, not file content.
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "inode/symlink" | "inode/folder-symlink" => LinkType::Symlink,
            "inode/hardlink" => LinkType::Hardlink,
            "inode/junction" => LinkType::Junction,
            "application/x-macos" => LinkType::FinderAlias,
            _ => LinkType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicaSide {
    Local,
    Remote,
    #[default]
    Unknown,
}

impl ReplicaSide {
    pub fn opposite(&self) -> ReplicaSide {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
            ReplicaSide::Unknown => ReplicaSide::Unknown,
        }
    }
}

impl fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaSide::Local => f.write_str("local"),
            ReplicaSide::Remote => f.write_str("remote"),
            ReplicaSide::Unknown => f.write_str("unknown"),
        }
    }
}

/// A path relative to a sync root, stored with NFC-normalized components.
///
/// All comparisons inside the engine go through this type, so NFD input
/// from the OS (macOS historically) and NFC input from the drive compare
/// equal when they denote the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPath(PathBuf);

impl SyncPath {
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut normalized = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::Normal(name) => {
                    normalized.push(normalize_name(&name.to_string_lossy()))
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    normalized.pop();
                }
            }
        }
        Self(normalized)
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn join(&self, name: &str) -> Self {
        Self(self.0.join(normalize_name(name)))
    }

    pub fn parent(&self) -> Option<SyncPath> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    pub fn name(&self) -> &str {
        self.0
            .file_name()
            .map(|name| name.to_str().unwrap_or(""))
            .unwrap_or("")
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Absolute filesystem path under the given sync root.
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    pub fn starts_with(&self, ancestor: &SyncPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            write!(f, "/{}", self.0.display())
        }
    }
}

/// Normalize a single name component to NFC.
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Classification of a pair of colliding operations, one per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictType {
    CreateCreate,
    EditEdit,
    MoveCreate,
    EditDelete,
    MoveDelete,
    MoveParentDelete,
    CreateParentDelete,
    MoveMoveSource,
    MoveMoveDest,
    MoveMoveCycle,
}

/// Produce the conflict-rename of `name`, e.g.
/// `a.txt` → `a (Conflict 1700000000).txt`.
pub fn conflict_name(name: &str, stamp: SyncTime) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{stem} (Conflict {stamp}).{ext}")
        }
        _ => format!("{name} (Conflict {stamp})"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sync_path_normalizes_nfd_to_nfc() {
        // "é" as NFD (e + combining acute) vs NFC.
        let nfd = SyncPath::new("caf\u{0065}\u{0301}/a.txt");
        let nfc = SyncPath::new("caf\u{00e9}/a.txt");
        assert_eq!(nfd, nfc);
    }

    #[test]
    fn sync_path_join_and_parent_round_trip() {
        let path = SyncPath::root().join("dir").join("a.txt");
        assert_eq!(path.name(), "a.txt");
        assert_eq!(path.parent().unwrap(), SyncPath::new("dir"));
        assert_eq!(SyncPath::new("dir").parent().unwrap(), SyncPath::root());
        assert!(SyncPath::root().parent().is_none() || SyncPath::root().is_root());
    }

    #[test]
    fn conflict_name_preserves_extension() {
        assert_eq!(conflict_name("x.txt", 42), "x (Conflict 42).txt");
        assert_eq!(conflict_name("noext", 42), "noext (Conflict 42)");
        assert_eq!(conflict_name(".hidden", 42), ".hidden (Conflict 42)");
    }

    #[test]
    fn link_type_from_sentinel_mime() {
        assert_eq!(LinkType::from_mime("inode/symlink"), LinkType::Symlink);
        assert_eq!(LinkType::from_mime("inode/junction"), LinkType::Junction);
        assert_eq!(LinkType::from_mime("text/plain"), LinkType::None);
    }
}
