//! Network jobs against the drive API.

mod download;
mod listing;
mod ops;
mod session;
mod upload;

pub use download::{DownloadJob, DownloadTarget, DOWNLOAD_CHUNK_SIZE};
pub use listing::{ContinueFileListJob, InitFileListJob};
pub use ops::{RemoteCreateDirJob, RemoteDeleteJob, RemoteMoveJob};
pub use session::{
    chunk_hash, chunk_plan, chunk_size_for, total_chunk_hash, SessionPhase, UploadSession,
    UploadSessionChunkJob, MAX_SESSION_CHUNKS, SESSION_CHUNK_MAX, SESSION_CHUNK_MIN,
    UPLOAD_SESSION_THRESHOLD,
};
pub use upload::{UploadJob, SINGLE_UPLOAD_MAX_SIZE};
