//! Local filesystem jobs.
//!
//! Counterparts of the network jobs for the local replica: each checks its
//! precondition against the live filesystem (the target still exists, still
//! carries the expected id) before acting, so a plan computed from frozen
//! snapshots cannot clobber changes that happened since the freeze.

use std::path::PathBuf;
use std::sync::Arc;

use watchfs::{Fs, IoResultExt};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::types::NodeId;

use super::{Job, JobState};

fn verify_file_id(fs: &Fs, path: &PathBuf, expected: &NodeId) -> SyncResult<()> {
    let meta = fs
        .metadata(path)
        .with_not_found()?
        .ok_or_else(|| ExitInfo::new(ExitCode::DataError, ExitCause::NotFound))?;

    if NodeId::from(meta.file_id) != *expected {
        return Err(ExitInfo::new(
            ExitCode::DataError,
            ExitCause::UnexpectedFileSystemEvent,
        ));
    }
    Ok(())
}

/// Creates one directory. The parent must already exist; plan ordering
/// guarantees parents are created first.
pub struct LocalCreateDirJob {
    state: JobState,
    fs: Arc<Fs>,
    path: PathBuf,
}

impl LocalCreateDirJob {
    pub fn new(fs: Arc<Fs>, path: PathBuf) -> Self {
        Self {
            state: JobState::new(),
            fs,
            path,
        }
    }

    /// File id of the created directory, readable after success.
    pub fn created_file_id(&self) -> SyncResult<NodeId> {
        let meta = self.fs.metadata(&self.path)?;
        Ok(NodeId::from(meta.file_id))
    }
}

impl Job for LocalCreateDirJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        if self.fs.exists(&self.path)? {
            return Err(ExitInfo::new(ExitCode::SystemError, ExitCause::FileExists));
        }
        self.fs.create_dir(&self.path)?;
        Ok(())
    }
}

/// Moves or renames one item, verifying the source still carries the
/// expected id and the destination is free.
pub struct LocalMoveJob {
    state: JobState,
    fs: Arc<Fs>,
    from: PathBuf,
    to: PathBuf,
    expected_id: NodeId,
}

impl LocalMoveJob {
    pub fn new(fs: Arc<Fs>, from: PathBuf, to: PathBuf, expected_id: NodeId) -> Self {
        Self {
            state: JobState::new(),
            fs,
            from,
            to,
            expected_id,
        }
    }
}

impl Job for LocalMoveJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        verify_file_id(&self.fs, &self.from, &self.expected_id)?;

        if self.fs.exists(&self.to)? {
            return Err(ExitInfo::new(
                ExitCode::SystemError,
                ExitCause::InvalidDestination,
            ));
        }

        self.fs.rename(&self.from, &self.to)?;
        Ok(())
    }
}

/// Deletes one item. Refuses when the item on disk no longer carries the
/// recorded id: the user may have replaced it since the plan was computed,
/// and deleting the replacement would eat their data.
pub struct LocalDeleteJob {
    state: JobState,
    fs: Arc<Fs>,
    path: PathBuf,
    expected_id: NodeId,
    is_directory: bool,
}

impl LocalDeleteJob {
    pub fn new(fs: Arc<Fs>, path: PathBuf, expected_id: NodeId, is_directory: bool) -> Self {
        Self {
            state: JobState::new(),
            fs,
            path,
            expected_id,
            is_directory,
        }
    }
}

impl Job for LocalDeleteJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        match self.fs.metadata(&self.path).with_not_found()? {
            // Already gone; the delete converged on its own.
            None => return Ok(()),
            Some(meta) => {
                if NodeId::from(meta.file_id) != self.expected_id {
                    return Err(ExitInfo::new(
                        ExitCode::DataError,
                        ExitCause::UnexpectedFileSystemEvent,
                    ));
                }
            }
        }

        if self.is_directory {
            self.fs.remove_dir_all(&self.path)?;
        } else {
            self.fs.remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Copies a file over a destination, preserving the destination's identity
/// and permissions. Used for edit-downloads and when
/// `KDRIVE_PRESERVE_PERMISSIONS_ON_CREATE` forces copy-over on create.
pub struct LocalCopyJob {
    state: JobState,
    fs: Arc<Fs>,
    from: PathBuf,
    to: PathBuf,
}

impl LocalCopyJob {
    pub fn new(fs: Arc<Fs>, from: PathBuf, to: PathBuf) -> Self {
        Self {
            state: JobState::new(),
            fs,
            from,
            to,
        }
    }
}

impl Job for LocalCopyJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        if !self.fs.exists(&self.from)? {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::NotFound));
        }
        let copied = self.fs.copy(&self.from, &self.to)?;
        self.state.set_progress(copied);
        Ok(())
    }
}
