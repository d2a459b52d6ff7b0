//! Chunked upload sessions.
//!
//! Files above [`UPLOAD_SESSION_THRESHOLD`] upload through a
//! server-coordinated session: `InitChunks → StartSession → UploadChunks →
//! CloseSession → Finished`. Each chunk is an independent sub-job with its
//! own hash; a rolling hash over all chunk hashes is sent at close so the
//! server can verify end-to-end integrity. The session token is persisted
//! in the sync DB when the session starts, so an interrupted session can be
//! cancelled on the next start before retrying.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watchfs::Fs;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::db::SyncDb;
use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::jobs::manager::JobManager;
use crate::jobs::{Job, JobId, JobPriority, JobState};
use crate::remote_api::{DriveApi, RemoteItem, SessionStartRequest};
use crate::types::{NodeId, SyncTime};

/// Files at or above this size must upload through a session.
pub const UPLOAD_SESSION_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const SESSION_CHUNK_MIN: u64 = 10 * 1024 * 1024;
pub const SESSION_CHUNK_MAX: u64 = 100 * 1024 * 1024;
/// Sessions requiring more chunks than this are refused.
pub const MAX_SESSION_CHUNKS: u64 = 10_000;

const WAIT_POLL: Duration = Duration::from_millis(20);

/// `clamp(filesize / 200, 10 MB, 100 MB)`.
pub fn chunk_size_for(file_size: u64) -> u64 {
    (file_size / 200).clamp(SESSION_CHUNK_MIN, SESSION_CHUNK_MAX)
}

/// Chunk size and count for a file, refusing files that would need more
/// than [`MAX_SESSION_CHUNKS`] chunks.
pub fn chunk_plan(file_size: u64) -> SyncResult<(u64, u64)> {
    let chunk_size = chunk_size_for(file_size);
    let total_chunks = file_size.div_ceil(chunk_size).max(1);
    if total_chunks > MAX_SESSION_CHUNKS {
        return Err(ExitInfo::new(ExitCode::DataError, ExitCause::FileTooBig));
    }
    Ok((chunk_size, total_chunks))
}

/// Hash of one chunk's content, as lowercase hex.
pub fn chunk_hash(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

/// Rolling hash over the chunk hashes in chunk order. This is not a content
/// checksum; the server recomputes it from the chunk hashes it received.
pub fn total_chunk_hash<S: AsRef<str>>(chunk_hashes: &[S]) -> String {
    let mut hasher = Xxh3::new();
    for hash in chunk_hashes {
        hasher.update(hash.as_ref().as_bytes());
    }
    format!("{:016x}", hasher.digest())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    InitChunks,
    StartSession,
    UploadChunks,
    CloseSession,
    Finished,
}

/// Uploads one chunk of an open session.
pub struct UploadSessionChunkJob {
    state: JobState,
    api: Arc<dyn DriveApi>,
    token: String,
    chunk_number: u64,
    hash: String,
    data: Vec<u8>,
}

impl UploadSessionChunkJob {
    pub fn new(
        api: Arc<dyn DriveApi>,
        parent_id: JobId,
        token: String,
        chunk_number: u64,
        data: Vec<u8>,
    ) -> Self {
        let hash = chunk_hash(&data);
        Self {
            state: JobState::with_parent(Some(parent_id)),
            api,
            token,
            chunk_number,
            hash,
            data,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Job for UploadSessionChunkJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> SyncResult<()> {
        if self.state.is_aborted() {
            return Err(ExitInfo::new(
                ExitCode::OperationCanceled,
                ExitCause::OperationCanceled,
            ));
        }
        self.api
            .upload_chunk(&self.token, self.chunk_number, &self.hash, &self.data)
    }
}

/// What the finished session created or replaced on the drive.
struct SessionOutcome {
    item: Option<RemoteItem>,
}

/// A multi-chunk upload session job.
pub struct UploadSession {
    state: JobState,
    api: Arc<dyn DriveApi>,
    fs: Arc<Fs>,
    db: Arc<SyncDb>,
    manager: Arc<JobManager>,
    local_abs_path: PathBuf,
    /// Set when creating a new remote file.
    file_name: Option<String>,
    remote_parent_id: Option<NodeId>,
    /// Set when replacing the content of an existing remote file.
    file_id: Option<NodeId>,
    created: SyncTime,
    modified: SyncTime,
    parallelism: usize,
    phase: Mutex<SessionPhase>,
    chunk_jobs: Mutex<Vec<Arc<UploadSessionChunkJob>>>,
    outcome: Mutex<SessionOutcome>,
}

impl UploadSession {
    /// Session that creates a new remote file.
    #[allow(clippy::too_many_arguments)]
    pub fn for_create(
        api: Arc<dyn DriveApi>,
        fs: Arc<Fs>,
        db: Arc<SyncDb>,
        manager: Arc<JobManager>,
        local_abs_path: PathBuf,
        file_name: String,
        remote_parent_id: NodeId,
        created: SyncTime,
        modified: SyncTime,
        parallelism: usize,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            fs,
            db,
            manager,
            local_abs_path,
            file_name: Some(file_name),
            remote_parent_id: Some(remote_parent_id),
            file_id: None,
            created,
            modified,
            parallelism: parallelism.max(1),
            phase: Mutex::new(SessionPhase::InitChunks),
            chunk_jobs: Mutex::new(Vec::new()),
            outcome: Mutex::new(SessionOutcome { item: None }),
        }
    }

    /// Session that replaces the content of an existing remote file.
    #[allow(clippy::too_many_arguments)]
    pub fn for_edit(
        api: Arc<dyn DriveApi>,
        fs: Arc<Fs>,
        db: Arc<SyncDb>,
        manager: Arc<JobManager>,
        local_abs_path: PathBuf,
        file_id: NodeId,
        modified: SyncTime,
        parallelism: usize,
    ) -> Self {
        Self {
            state: JobState::new(),
            api,
            fs,
            db,
            manager,
            local_abs_path,
            file_name: None,
            remote_parent_id: None,
            file_id: Some(file_id),
            created: 0,
            modified,
            parallelism: parallelism.max(1),
            phase: Mutex::new(SessionPhase::InitChunks),
            chunk_jobs: Mutex::new(Vec::new()),
            outcome: Mutex::new(SessionOutcome { item: None }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap()
    }

    pub fn uploaded_item(&self) -> Option<RemoteItem> {
        self.outcome.lock().unwrap().item.clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn canceled() -> ExitInfo {
        ExitInfo::new(ExitCode::OperationCanceled, ExitCause::OperationCanceled)
    }

    /// Cancel the session on the server and drop the persisted token.
    fn cancel_session(&self, token: &str, token_db_id: i64) {
        if let Err(exit) = self.api.cancel_upload_session(token) {
            log::warn!("Upload session cancel failed for {}: {}", token, exit);
        }
        if let Err(exit) = self.db.delete_upload_session_token(token_db_id) {
            log::warn!("Could not delete upload session token: {}", exit);
        }
    }

    fn wait_for_chunks(&self, in_flight: &mut Vec<JobId>, drain_to: usize) -> SyncResult<()> {
        while in_flight.len() > drain_to {
            if self.state.is_aborted() {
                return Err(Self::canceled());
            }

            in_flight.retain(|&job_id| !self.manager.is_job_finished(job_id));
            if in_flight.len() > drain_to {
                std::thread::sleep(WAIT_POLL);
            }
        }

        // Check outcomes of everything finished so far.
        let jobs = self.chunk_jobs.lock().unwrap();
        for job in jobs.iter() {
            if job.state().is_finished() {
                let exit = job.state().exit_info();
                if !exit.is_ok() {
                    return Err(exit);
                }
            }
        }
        Ok(())
    }
}

impl Job for UploadSession {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn abort(&self) {
        self.state.abort();
        for job in self.chunk_jobs.lock().unwrap().iter() {
            job.abort();
        }
    }

    fn execute(&self) -> SyncResult<()> {
        // InitChunks: size the chunks and hash the content.
        self.set_phase(SessionPhase::InitChunks);

        let meta = self.fs.metadata(&self.local_abs_path)?;
        let file_size = meta.size;
        let (chunk_size, total_chunks) = chunk_plan(file_size)?;

        let data = self.fs.read(&self.local_abs_path)?;
        if data.len() as u64 != file_size {
            // The file changed between stat and read; let the next pass
            // pick up the new content.
            return Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::UnexpectedFileSystemEvent,
            ));
        }

        self.state.set_expected_progress(file_size);

        // StartSession: obtain and persist the token.
        self.set_phase(SessionPhase::StartSession);

        let request = SessionStartRequest {
            total_size: file_size,
            total_chunks,
            file_name: self.file_name.clone(),
            parent_id: self.remote_parent_id.clone(),
            file_id: self.file_id.clone(),
        };
        let token = self.api.start_upload_session(&request)?;
        let token_db_id = self.db.insert_upload_session_token(&token)?;

        // UploadChunks: each chunk is an independent sub-job; parallelism
        // is bounded by `parallelism`.
        self.set_phase(SessionPhase::UploadChunks);

        let mut chunk_hashes = Vec::with_capacity(total_chunks as usize);
        let mut in_flight: Vec<JobId> = Vec::new();
        let mut upload_error: Option<ExitInfo> = None;

        // An empty file still carries one (empty) chunk so the declared
        // chunk count holds.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(chunk_size as usize).collect()
        };

        for (index, chunk) in chunks.into_iter().enumerate() {
            if self.state.is_aborted() {
                upload_error = Some(Self::canceled());
                break;
            }

            if let Err(exit) = self.wait_for_chunks(&mut in_flight, self.parallelism - 1) {
                upload_error = Some(exit);
                break;
            }

            let chunk_job = Arc::new(UploadSessionChunkJob::new(
                Arc::clone(&self.api),
                self.state.id(),
                token.clone(),
                index as u64 + 1,
                chunk.to_vec(),
            ));
            chunk_hashes.push(chunk_job.hash().to_owned());

            let chunk_len = chunk.len() as u64;
            self.state.add_progress(chunk_len);

            self.chunk_jobs.lock().unwrap().push(Arc::clone(&chunk_job));
            let job_id = self
                .manager
                .queue(chunk_job as Arc<dyn Job>, JobPriority::Normal);
            in_flight.push(job_id);
        }

        if upload_error.is_none() {
            if let Err(exit) = self.wait_for_chunks(&mut in_flight, 0) {
                upload_error = Some(exit);
            }
        }

        if let Some(exit) = upload_error {
            // Any chunk failure aborts the whole session and releases the
            // server-side token.
            for job in self.chunk_jobs.lock().unwrap().iter() {
                job.abort();
            }
            self.cancel_session(&token, token_db_id);
            return Err(exit);
        }

        // CloseSession: send the rolling hash for end-to-end verification.
        self.set_phase(SessionPhase::CloseSession);

        let total_hash = total_chunk_hash(&chunk_hashes);
        let item = match self.api.finish_upload_session(&token, &total_hash) {
            Ok(item) => item,
            Err(exit) => {
                self.cancel_session(&token, token_db_id);
                return Err(exit);
            }
        };

        if self.db.delete_upload_session_token(token_db_id)? {
            log::debug!("Upload session {} finished, token released", token);
        }

        self.outcome.lock().unwrap().item = Some(item);
        self.set_phase(SessionPhase::Finished);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jobs::run_sync;
    use crate::remote_api::InMemoryDrive;
    use watchfs::InMemoryFs;

    #[test]
    fn chunk_size_follows_clamp_rule() {
        assert_eq!(chunk_size_for(0), SESSION_CHUNK_MIN);
        assert_eq!(chunk_size_for(1024), SESSION_CHUNK_MIN);
        // 4 GB / 200 = ~20 MB, inside the clamp window.
        assert_eq!(chunk_size_for(4 * 1024 * 1024 * 1024), 4 * 1024 * 1024 * 1024 / 200);
        // Enormous file hits the ceiling.
        assert_eq!(chunk_size_for(u64::MAX / 2), SESSION_CHUNK_MAX);
    }

    #[test]
    fn oversized_file_is_refused_before_any_network_io() {
        // 2 TB at the 100 MB chunk ceiling needs > 10 000 chunks.
        let err = chunk_plan(2 * 1024 * 1024 * 1024 * 1024).unwrap_err();
        assert_eq!(err.code(), ExitCode::DataError);
        assert_eq!(err.cause(), ExitCause::FileTooBig);

        // 250 MB fits comfortably: >= 3 chunks of at most 100 MB each.
        let (chunk_size, total_chunks) = chunk_plan(250 * 1024 * 1024).unwrap();
        assert!(total_chunks >= 3);
        assert!(chunk_size <= SESSION_CHUNK_MAX);
    }

    #[test]
    fn total_hash_is_order_sensitive() {
        let a = chunk_hash(b"aaa");
        let b = chunk_hash(b"bbb");
        assert_ne!(
            total_chunk_hash(&[a.clone(), b.clone()]),
            total_chunk_hash(&[b, a])
        );
    }

    fn session_fixture(contents: &[u8]) -> (InMemoryDrive, Arc<SyncDb>, Arc<JobManager>, UploadSession) {
        let drive = InMemoryDrive::new();
        let fs = Arc::new(Fs::new(InMemoryFs::new()));
        fs.create_dir_all("/sync").unwrap();
        fs.write("/sync/big.bin", contents).unwrap();

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let manager = JobManager::with_capacity(4);

        let session = UploadSession::for_create(
            Arc::new(drive.clone()),
            fs,
            Arc::clone(&db),
            Arc::clone(&manager),
            "/sync/big.bin".into(),
            "big.bin".into(),
            drive.root_id(),
            1,
            2,
            3,
        );
        (drive, db, manager, session)
    }

    #[test]
    fn session_uploads_and_releases_token() {
        // Small content still exercises the full state machine with a
        // single chunk.
        let (drive, db, manager, session) = session_fixture(b"chunked content");

        assert!(run_sync(&session).is_ok());
        assert_eq!(session.phase(), SessionPhase::Finished);

        let item = session.uploaded_item().unwrap();
        assert_eq!(drive.content(&item.id).unwrap(), b"chunked content");
        assert!(db.upload_session_tokens().unwrap().is_empty());
        assert_eq!(drive.open_session_count(), 0);
        manager.stop();
    }

    #[test]
    fn aborted_session_cancels_on_server() {
        let (drive, db, manager, session) = session_fixture(b"payload");
        session.abort();

        assert_eq!(run_sync(&session).code(), ExitCode::OperationCanceled);
        assert!(session.uploaded_item().is_none());
        assert_eq!(drive.open_session_count(), 0);
        assert!(db.upload_session_tokens().unwrap().is_empty());
        manager.stop();
    }
}
