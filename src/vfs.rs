//! Virtual-filesystem collaborator.
//!
//! The platform integration (Cloud Files on Windows, File Provider on
//! macOS, a FUSE layer elsewhere) lives outside this crate; the engine only
//! calls the capability set below. Syncs without virtual files plug in
//! [`NoopVfs`].

use std::path::{Path, PathBuf};

use watchfs::Fs;

use crate::error::SyncResult;
use crate::types::{NodeId, SyncTime};

/// User- or system-set intent for a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinState {
    AlwaysLocal,
    OnlineOnly,
    #[default]
    Unspecified,
}

/// Placeholder status as reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VfsStatus {
    pub is_placeholder: bool,
    pub is_hydrated: bool,
    pub is_syncing: bool,
    /// Hydration progress, 0..=100.
    pub progress: u8,
}

/// Outcome of a fetch-progress update: the platform can cancel a hydration
/// mid-flight, and reports when the transfer is considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStatus {
    pub canceled: bool,
    pub finished: bool,
}

/// Capability set the engine requires from the virtual-filesystem layer.
pub trait Vfs: Send + Sync {
    fn status(&self, path: &Path) -> SyncResult<VfsStatus>;
    fn force_status(&self, path: &Path, status: VfsStatus) -> SyncResult<()>;
    fn set_pin_state(&self, path: &Path, state: PinState) -> SyncResult<()>;
    fn pin_state(&self, path: &Path) -> SyncResult<PinState>;
    fn update_metadata(
        &self,
        path: &Path,
        created: SyncTime,
        modified: SyncTime,
        size: i64,
        remote_node_id: &NodeId,
    ) -> SyncResult<()>;
    fn update_fetch_status(
        &self,
        temp_path: &Path,
        final_path: &Path,
        bytes_received: u64,
    ) -> SyncResult<FetchStatus>;
    fn cancel_hydrate(&self, path: &Path) -> SyncResult<()>;
    fn exclude(&self, path: &Path) -> SyncResult<()>;
    fn clear_file_attributes(&self, path: &Path) -> SyncResult<()>;
    fn file_status_changed(&self, path: &Path, status: VfsStatus) -> SyncResult<()>;
}

/// Vfs implementation for syncs without virtual files. Every file is a
/// plain file: always hydrated, never a placeholder.
#[derive(Debug, Default)]
pub struct NoopVfs;

impl Vfs for NoopVfs {
    fn status(&self, _path: &Path) -> SyncResult<VfsStatus> {
        Ok(VfsStatus {
            is_placeholder: false,
            is_hydrated: true,
            is_syncing: false,
            progress: 100,
        })
    }

    fn force_status(&self, _path: &Path, _status: VfsStatus) -> SyncResult<()> {
        Ok(())
    }

    fn set_pin_state(&self, _path: &Path, _state: PinState) -> SyncResult<()> {
        Ok(())
    }

    fn pin_state(&self, _path: &Path) -> SyncResult<PinState> {
        Ok(PinState::Unspecified)
    }

    fn update_metadata(
        &self,
        _path: &Path,
        _created: SyncTime,
        _modified: SyncTime,
        _size: i64,
        _remote_node_id: &NodeId,
    ) -> SyncResult<()> {
        Ok(())
    }

    fn update_fetch_status(
        &self,
        _temp_path: &Path,
        _final_path: &Path,
        _bytes_received: u64,
    ) -> SyncResult<FetchStatus> {
        Ok(FetchStatus {
            canceled: false,
            finished: false,
        })
    }

    fn cancel_hydrate(&self, _path: &Path) -> SyncResult<()> {
        Ok(())
    }

    fn exclude(&self, _path: &Path) -> SyncResult<()> {
        Ok(())
    }

    fn clear_file_attributes(&self, _path: &Path) -> SyncResult<()> {
        Ok(())
    }

    fn file_status_changed(&self, _path: &Path, _status: VfsStatus) -> SyncResult<()> {
        Ok(())
    }
}

/// Strips virtual-file state from a sync root when the sync pair is
/// unlinked or virtual files are turned off: placeholder attributes are
/// cleared on every hydrated entry, and dehydrated placeholders (whose
/// content was never downloaded) are deleted so the tree is left as plain
/// files. Runs from `SyncEngine::dismantle` and the `unlink` CLI command;
/// the engine's own state directory is left alone.
pub struct VirtualFilesCleaner<'a> {
    vfs: &'a dyn Vfs,
    fs: &'a Fs,
}

impl<'a> VirtualFilesCleaner<'a> {
    pub fn new(vfs: &'a dyn Vfs, fs: &'a Fs) -> Self {
        Self { vfs, fs }
    }

    /// Walk the sync root and clean every entry. Returns the paths of
    /// dehydrated placeholders that were removed.
    pub fn clean_root(&self, root: &Path) -> SyncResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        self.clean_dir(root, &mut removed)?;
        Ok(removed)
    }

    fn clean_dir(&self, dir: &Path, removed: &mut Vec<PathBuf>) -> SyncResult<()> {
        let entries = match self.fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Skipping unreadable directory {}: {}", dir.display(), err);
                return Ok(());
            }
        };

        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path().to_path_buf();
            if path.file_name().is_some_and(|name| name == ".keel") {
                continue;
            }

            let Ok(meta) = self.fs.metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                self.clean_dir(&path, removed)?;
                continue;
            }

            let status = self.vfs.status(&path)?;
            if status.is_placeholder && !status.is_hydrated {
                if let Err(err) = self.fs.remove_file(&path) {
                    log::warn!(
                        "Failed to remove dehydrated placeholder {}: {}",
                        path.display(),
                        err
                    );
                    continue;
                }
                removed.push(path);
            } else {
                self.vfs.clear_file_attributes(&path)?;
            }
        }
        Ok(())
    }
}
