pub mod cli;

mod blacklist;
mod cache;
mod db;
mod engine;
mod error;
mod exclusion;
mod executor;
mod jobs;
pub mod logging;
mod observer;
mod reconcile;
mod remote_api;
mod snapshot;
mod types;
mod vfs;

pub use blacklist::{TmpBlacklist, BLACKLIST_THRESHOLD};
pub use cache::{cache_dir, check_disk_space, tmp_dir, DISK_SPACE_SAFETY_FLOOR};
pub use db::{AppStateKey, DbNode, NodeStatus, ParmsDb, SyncConfig, SyncDb, SyncNodeKind};
pub use engine::{EngineOptions, EngineParams, PassSummary, SyncEngine, SyncState};
pub use error::{
    log_error_sink, ErrorLevel, ErrorSink, ExitCause, ExitCode, ExitInfo, SyncError, SyncResult,
};
pub use exclusion::ExclusionTemplates;
pub use executor::Executor;
pub use jobs::manager::{JobManager, POOL_MAX_CAPACITY, POOL_MIN_CAPACITY};
pub use jobs::network::{
    chunk_hash, chunk_plan, total_chunk_hash, DownloadJob, DownloadTarget, SessionPhase,
    UploadJob, UploadSession, MAX_SESSION_CHUNKS, SESSION_CHUNK_MAX, SESSION_CHUNK_MIN,
    UPLOAD_SESSION_THRESHOLD,
};
pub use jobs::local::{LocalCopyJob, LocalCreateDirJob, LocalDeleteJob, LocalMoveJob};
pub use jobs::network::{
    ContinueFileListJob, InitFileListJob, RemoteCreateDirJob, RemoteDeleteJob, RemoteMoveJob,
};
pub use jobs::{run_sync, Job, JobId, JobPriority, JobState};
pub use reconcile::{ChangeType, Conflict, SyncOp, SyncOpType, UpdateTree};
pub use remote_api::{
    ActionCode, AuthClient, ChangeBatch, DriveApi, HttpDrive, InMemoryDrive, ListingPage,
    RemoteChange, RemoteItem, SessionStartRequest, TokenPair,
};
pub use snapshot::{ConstSnapshot, LiveSnapshot, Snapshot, SnapshotItem};
pub use types::{
    conflict_name, normalize_name, ConflictType, DbNodeId, LinkType, NodeId, NodeType,
    ReplicaSide, SyncPath, SyncTime,
};
pub use vfs::{FetchStatus, NoopVfs, PinState, Vfs, VfsStatus, VirtualFilesCleaner};
