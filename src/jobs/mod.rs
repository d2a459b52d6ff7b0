//! Job abstraction.
//!
//! All network and filesystem I/O runs as a [`Job`]: a capability set of
//! id, priority, parent link, cooperative abort, progress, and an
//! [`ExitInfo`] outcome. Jobs run synchronously (the caller blocks) or
//! asynchronously through the [`manager::JobManager`] worker pool.

pub mod local;
pub mod manager;
pub mod network;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};

pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduling priority. Ordering is derived, lowest first, so
/// `Highest > Normal` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

/// Book-keeping shared by every job: identity, abort flag, outcome, and
/// optional progress. Concrete jobs embed one and expose it through
/// [`Job::state`].
pub struct JobState {
    id: JobId,
    parent_id: Option<JobId>,
    aborted: AtomicBool,
    finished: AtomicBool,
    exit: Mutex<ExitInfo>,
    progress: AtomicU64,
    expected_progress: AtomicU64,
}

impl JobState {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    pub fn with_parent(parent_id: Option<JobId>) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            parent_id,
            aborted: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            exit: Mutex::new(ExitInfo::from(ExitCode::Unknown)),
            progress: AtomicU64::new(0),
            expected_progress: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn parent_id(&self) -> Option<JobId> {
        self.parent_id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn exit_info(&self) -> ExitInfo {
        *self.exit.lock().unwrap()
    }

    pub fn set_expected_progress(&self, expected: u64) {
        self.expected_progress.store(expected, Ordering::Relaxed);
    }

    pub fn set_progress(&self, progress: u64) {
        self.progress.store(progress, Ordering::Relaxed);
    }

    pub fn add_progress(&self, delta: u64) {
        self.progress.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn progress(&self) -> (u64, u64) {
        (
            self.progress.load(Ordering::Relaxed),
            self.expected_progress.load(Ordering::Relaxed),
        )
    }

    fn record_outcome(&self, outcome: SyncResult<()>) {
        let exit = match outcome {
            Ok(()) => ExitInfo::from(ExitCode::Ok),
            Err(exit) => exit,
        };
        *self.exit.lock().unwrap() = exit;
        self.finished.store(true, Ordering::Release);
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability set the job manager and the executor operate against.
/// Concrete jobs are tagged variants over this set.
pub trait Job: Send + Sync {
    fn state(&self) -> &JobState;

    /// Precondition check. Returning `false` parks the job on the pending
    /// queue until a later tick.
    fn can_run(&self) -> bool {
        true
    }

    /// Perform the work. Long operations must poll
    /// `self.state().is_aborted()` and bail with `OperationCanceled`.
    fn execute(&self) -> SyncResult<()>;

    /// Propagate an abort to child jobs. The default only flags this job.
    fn abort(&self) {
        self.state().abort();
    }
}

/// Run a job on the calling thread, recording its outcome.
pub fn run_sync(job: &dyn Job) -> ExitInfo {
    if job.state().is_aborted() {
        job.state().record_outcome(Err(ExitInfo::new(
            ExitCode::OperationCanceled,
            ExitCause::OperationCanceled,
        )));
        return job.state().exit_info();
    }

    let outcome = job.execute();
    job.state().record_outcome(outcome);
    job.state().exit_info()
}

#[cfg(test)]
mod test {
    use super::*;

    struct FlagJob {
        state: JobState,
        fail: bool,
    }

    impl Job for FlagJob {
        fn state(&self) -> &JobState {
            &self.state
        }

        fn execute(&self) -> SyncResult<()> {
            if self.fail {
                Err(ExitInfo::from(ExitCode::NetworkError))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn job_ids_are_unique_and_increasing() {
        let a = JobState::new();
        let b = JobState::new();
        assert!(b.id() > a.id());
    }

    #[test]
    fn run_sync_records_success_and_failure() {
        let ok = FlagJob {
            state: JobState::new(),
            fail: false,
        };
        assert_eq!(run_sync(&ok).code(), ExitCode::Ok);
        assert!(ok.state().is_finished());

        let bad = FlagJob {
            state: JobState::new(),
            fail: true,
        };
        assert_eq!(run_sync(&bad).code(), ExitCode::NetworkError);
    }

    #[test]
    fn aborted_job_short_circuits() {
        let job = FlagJob {
            state: JobState::new(),
            fail: false,
        };
        job.abort();
        assert_eq!(run_sync(&job).code(), ExitCode::OperationCanceled);
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Highest > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }
}
