//! Single-shot upload job for files up to [`SINGLE_UPLOAD_MAX_SIZE`].
//! Larger files go through an upload session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use watchfs::Fs;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::jobs::{Job, JobState};
use crate::remote_api::{DriveApi, RemoteItem};
use crate::types::{NodeId, SyncTime};

/// Files above this size must use an upload session.
pub const SINGLE_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Reads a whole local file, hashes it, and POSTs it with metadata.
pub struct UploadJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    fs: Arc<Fs>,
    local_abs_path: PathBuf,
    remote_parent_id: NodeId,
    name: String,
    created: SyncTime,
    modified: SyncTime,
    uploaded: Mutex<Option<RemoteItem>>,
    content_hash: Mutex<Option<String>>,
}

impl UploadJob {
    pub fn new(
        api: Arc<dyn DriveApi>,
        fs: Arc<Fs>,
        local_abs_path: PathBuf,
        remote_parent_id: NodeId,
        name: String,
        created: SyncTime,
        modified: SyncTime,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            fs,
            local_abs_path,
            remote_parent_id,
            name,
            created,
            modified,
            uploaded: Mutex::new(None),
            content_hash: Mutex::new(None),
        }
    }

    pub fn uploaded_item(&self) -> Option<RemoteItem> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn content_hash(&self) -> Option<String> {
        self.content_hash.lock().unwrap().clone()
    }
}

impl Job for UploadJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        let meta = self.fs.metadata(&self.local_abs_path)?;
        if meta.size > SINGLE_UPLOAD_MAX_SIZE {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::FileTooBig));
        }

        let data = self.fs.read(&self.local_abs_path)?;
        self.state.set_expected_progress(data.len() as u64);

        if self.state.is_aborted() {
            return Err(ExitInfo::new(
                ExitCode::OperationCanceled,
                ExitCause::OperationCanceled,
            ));
        }

        let content_hash = format!("{:016x}", xxh3_64(&data));
        *self.content_hash.lock().unwrap() = Some(content_hash.clone());
        let item = self.api.upload(
            &self.remote_parent_id,
            &self.name,
            &data,
            &content_hash,
            self.created,
            self.modified,
        )?;

        self.state.set_progress(data.len() as u64);
        *self.uploaded.lock().unwrap() = Some(item);
        Ok(())
    }
}
