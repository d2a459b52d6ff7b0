//! Error currency of the sync engine.
//!
//! I/O, DB, and network operations report failure as an [`ExitInfo`] value
//! (a small closed code plus a cause detail) rather than a panic or an
//! opaque error chain. Typed errors from other crates are converted at the
//! module seams.

use std::fmt;
use std::io;

use crate::types::{ConflictType, NodeId, ReplicaSide, SyncPath};

/// Closed set of outcome codes. The executor and the master worker branch
/// on these to decide between retry, skip, pause, and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitCode {
    #[default]
    Ok,
    Unknown,
    NeedRestart,
    NetworkError,
    InvalidToken,
    DataError,
    DbError,
    BackError,
    SystemError,
    FatalError,
    LogicError,
    TokenRefreshed,
    RateLimited,
    InvalidSync,
    InvalidOperation,
    UpdateRequired,
    OperationCanceled,
}

/// Detail attached to an [`ExitCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitCause {
    #[default]
    Unknown,
    NotFound,
    FileAccessError,
    FileExists,
    InvalidDestination,
    InvalidSnapshot,
    InvalidName,
    UnexpectedFileSystemEvent,
    NotEnoughDiskSpace,
    FileTooBig,
    QuotaExceeded,
    DbAccessError,
    DbEntryNotFound,
    HttpErrForbidden,
    SyncDirAccessError,
    SyncDirChanged,
    FileOrDirectoryCorrupted,
    OperationCanceled,
    LoginError,
}

/// `(code, cause)` pair returned by every fallible engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    code: ExitCode,
    cause: ExitCause,
}

impl std::error::Error for ExitInfo {}

impl ExitInfo {
    pub fn new(code: ExitCode, cause: ExitCause) -> Self {
        Self { code, cause }
    }

    pub fn code(&self) -> ExitCode {
        self.code
    }

    pub fn cause(&self) -> ExitCause {
        self.cause
    }

    pub fn is_ok(&self) -> bool {
        self.code == ExitCode::Ok
    }

    /// Whether the executor should retry the operation after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ExitCode::NetworkError | ExitCode::RateLimited)
            && self.cause != ExitCause::SyncDirAccessError
    }

    /// Whether the whole pass must stop rather than skipping the item.
    pub fn stops_pass(&self) -> bool {
        matches!(
            self.cause,
            ExitCause::NotEnoughDiskSpace | ExitCause::QuotaExceeded | ExitCause::SyncDirAccessError
        ) || matches!(
            self.code,
            ExitCode::DbError | ExitCode::InvalidToken | ExitCode::FatalError
        )
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self.code, self.cause)
    }
}

impl From<ExitCode> for ExitInfo {
    fn from(code: ExitCode) -> Self {
        Self {
            code,
            cause: ExitCause::Unknown,
        }
    }
}

impl From<io::Error> for ExitInfo {
    fn from(err: io::Error) -> Self {
        let cause = match err.kind() {
            io::ErrorKind::NotFound => ExitCause::NotFound,
            io::ErrorKind::PermissionDenied => ExitCause::FileAccessError,
            io::ErrorKind::AlreadyExists => ExitCause::FileExists,
            io::ErrorKind::StorageFull => ExitCause::NotEnoughDiskSpace,
            io::ErrorKind::InvalidData => ExitCause::FileOrDirectoryCorrupted,
            _ => ExitCause::Unknown,
        };
        Self {
            code: ExitCode::SystemError,
            cause,
        }
    }
}

impl From<rusqlite::Error> for ExitInfo {
    fn from(err: rusqlite::Error) -> Self {
        let cause = match err {
            rusqlite::Error::QueryReturnedNoRows => ExitCause::DbEntryNotFound,
            _ => ExitCause::DbAccessError,
        };
        Self {
            code: ExitCode::DbError,
            cause,
        }
    }
}

impl From<reqwest::Error> for ExitInfo {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self {
                code: ExitCode::NetworkError,
                cause: ExitCause::Unknown,
            };
        }
        Self {
            code: ExitCode::BackError,
            cause: ExitCause::Unknown,
        }
    }
}

/// Result alias used across the engine.
pub type SyncResult<T> = Result<T, ExitInfo>;

/// Severity of a user-visible error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// The whole sync is affected (paused or stopped).
    Sync,
    /// A single item is affected; the sync continues.
    Node,
}

/// A user-visible error record, reported through the engine's `add_error`
/// callback and rendered by the UI layer outside this crate.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub level: ErrorLevel,
    pub side: ReplicaSide,
    pub path: Option<SyncPath>,
    pub node_id: Option<NodeId>,
    pub exit: ExitInfo,
    pub conflict: Option<ConflictType>,
}

impl SyncError {
    pub fn sync(exit: ExitInfo) -> Self {
        Self {
            level: ErrorLevel::Sync,
            side: ReplicaSide::Unknown,
            path: None,
            node_id: None,
            exit,
            conflict: None,
        }
    }

    pub fn node(side: ReplicaSide, path: SyncPath, exit: ExitInfo) -> Self {
        Self {
            level: ErrorLevel::Node,
            side,
            path: Some(path),
            node_id: None,
            exit,
            conflict: None,
        }
    }

    pub fn conflict(side: ReplicaSide, path: SyncPath, conflict: ConflictType) -> Self {
        Self {
            level: ErrorLevel::Node,
            side,
            path: Some(path),
            node_id: None,
            exit: ExitInfo::new(ExitCode::DataError, ExitCause::Unknown),
            conflict: Some(conflict),
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Callback used to surface [`SyncError`]s to whoever embeds the engine.
pub type ErrorSink = std::sync::Arc<dyn Fn(SyncError) + Send + Sync>;

/// Invoke an [`ErrorSink`].
pub fn report(sink: &ErrorSink, error: SyncError) {
    sink.as_ref()(error);
}

/// An `ErrorSink` that only logs. Useful for tests and headless runs.
pub fn log_error_sink() -> ErrorSink {
    std::sync::Arc::new(|err: SyncError| {
        log::warn!(
            "sync error: {} side={:?} path={:?} conflict={:?}",
            err.exit,
            err.side,
            err.path,
            err.conflict
        );
    })
}
