//! Small REST jobs: move, delete, create-directory.
//!
//! Each has a concise precondition check and a single API call. The
//! interesting one is [`RemoteDeleteJob`]: it refuses to run while the
//! local item still exists under its recorded id, which stops the sync
//! from eating a file the user recreated with the same inode.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use watchfs::{Fs, IoResultExt};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::jobs::{Job, JobState};
use crate::remote_api::{DriveApi, RemoteItem};
use crate::types::NodeId;

/// Moves (and optionally renames) a remote item.
pub struct RemoteMoveJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    file_id: NodeId,
    dest_parent_id: NodeId,
    new_name: Option<String>,
}

impl RemoteMoveJob {
    pub fn new(
        api: Arc<dyn DriveApi>,
        file_id: NodeId,
        dest_parent_id: NodeId,
        new_name: Option<String>,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            file_id,
            dest_parent_id,
            new_name,
        }
    }
}

impl Job for RemoteMoveJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        self.api
            .move_item(&self.file_id, &self.dest_parent_id, self.new_name.as_deref())
    }
}

/// Deletes a remote item, propagating a local delete.
pub struct RemoteDeleteJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    fs: Arc<Fs>,
    remote_id: NodeId,
    local_abs_path: PathBuf,
    recorded_local_id: NodeId,
}

impl RemoteDeleteJob {
    pub fn new(
        api: Arc<dyn DriveApi>,
        fs: Arc<Fs>,
        remote_id: NodeId,
        local_abs_path: PathBuf,
        recorded_local_id: NodeId,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            fs,
            remote_id,
            local_abs_path,
            recorded_local_id,
        }
    }
}

impl Job for RemoteDeleteJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        if let Some(meta) = self.fs.metadata(&self.local_abs_path).with_not_found()? {
            if NodeId::from(meta.file_id) == self.recorded_local_id {
                log::warn!(
                    "Refusing remote delete of {}: local item still exists at {}",
                    self.remote_id,
                    self.local_abs_path.display()
                );
                return Err(ExitInfo::new(
                    ExitCode::DataError,
                    ExitCause::UnexpectedFileSystemEvent,
                ));
            }
        }

        match self.api.delete(&self.remote_id) {
            Ok(()) => Ok(()),
            // Already gone remotely; the delete converged on its own.
            Err(exit) if exit.cause() == ExitCause::NotFound => Ok(()),
            Err(exit) => Err(exit),
        }
    }
}

/// Creates a remote directory and exposes the resulting item.
pub struct RemoteCreateDirJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    parent_id: NodeId,
    name: String,
    created: Mutex<Option<RemoteItem>>,
}

impl RemoteCreateDirJob {
    pub fn new(api: Arc<dyn DriveApi>, parent_id: NodeId, name: String) -> Self {
        Self {
            state: JobState::new(),
            api,
            parent_id,
            name,
            created: Mutex::new(None),
        }
    }

    pub fn created_item(&self) -> Option<RemoteItem> {
        self.created.lock().unwrap().clone()
    }
}

impl Job for RemoteCreateDirJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        let item = self.api.create_dir(&self.parent_id, &self.name)?;
        *self.created.lock().unwrap() = Some(item);
        Ok(())
    }
}
