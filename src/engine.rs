//! The sync engine master worker.
//!
//! One `SyncEngine` instance runs per configured sync pair. It owns the
//! two observers and drives the reconciliation pipeline on its own thread:
//! freeze snapshots, diff, build trees, check platform names, find and
//! resolve conflicts, generate and sort operations, execute. Only I/O
//! parallelizes (inside jobs); the pipeline stages themselves run
//! sequentially on the master thread.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use watchfs::Fs;
use xxhash_rust::xxh3::xxh3_64;

use crate::blacklist::TmpBlacklist;
use crate::db::SyncDb;
use crate::error::{report, ErrorSink, ExitCause, ExitCode, ExitInfo, SyncError, SyncResult};
use crate::exclusion::ExclusionTemplates;
use crate::executor::Executor;
use crate::jobs::manager::JobManager;
use crate::observer::{LocalObserver, RemoteObserver};
use crate::reconcile::resolve::ContentProbe;
use crate::reconcile::tree::build_update_tree;
use crate::reconcile::{
    check_platform_inconsistencies, compute_operations, find_conflicts, generate_operations,
    resolve_conflicts, sort_operations,
};
use crate::remote_api::DriveApi;
use crate::types::{NodeId, ReplicaSide, SyncPath, SyncTime};
use crate::vfs::{Vfs, VirtualFilesCleaner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Starting = 0,
    Idle = 1,
    Running = 2,
    Paused = 3,
    Error = 4,
    Stopped = 5,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncState::Idle,
            2 => SyncState::Running,
            3 => SyncState::Paused,
            4 => SyncState::Error,
            5 => SyncState::Stopped,
            _ => SyncState::Starting,
        }
    }
}

/// Tunable pacing of the master loop.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long the local observer must be quiet before a pass starts.
    pub quiescence: Duration,
    /// Remote observer poll interval.
    pub remote_poll: Duration,
    /// Sleep between master loop iterations.
    pub loop_interval: Duration,
    /// Backoff after a network failure.
    pub network_backoff: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_secs(1),
            remote_poll: Duration::from_secs(5),
            loop_interval: Duration::from_millis(200),
            network_backoff: Duration::from_secs(30),
        }
    }
}

/// Everything a sync pair needs to run.
pub struct EngineParams {
    pub fs: Arc<Fs>,
    pub api: Arc<dyn DriveApi>,
    pub vfs: Arc<dyn Vfs>,
    pub db: Arc<SyncDb>,
    pub manager: Arc<JobManager>,
    pub errors: ErrorSink,
    pub local_root: PathBuf,
    pub local_root_id: NodeId,
    pub remote_root_id: NodeId,
    pub exclusions: Arc<ExclusionTemplates>,
    pub fault_receiver: Option<crossbeam_channel::Receiver<watchfs::WatcherFault>>,
    pub options: EngineOptions,
}

/// Summary of one pipeline pass.
#[derive(Debug, Default)]
pub struct PassSummary {
    pub planned: usize,
    pub completed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// Run another pass immediately.
    pub restart: bool,
}

/// Content probe backed by the real replicas: hashes the local file and
/// the remote content. Only consulted when sizes already match, so the
/// remote read is rare.
struct ReplicaProbe {
    fs: Arc<Fs>,
    api: Arc<dyn DriveApi>,
    local_root: PathBuf,
}

impl ContentProbe for ReplicaProbe {
    fn local_hash(&self, path: &SyncPath) -> Option<String> {
        let data = self.fs.read(path.under(&self.local_root)).ok()?;
        Some(format!("{:016x}", xxh3_64(&data)))
    }

    fn remote_hash(&self, id: &NodeId) -> Option<String> {
        let mut stream = self.api.download(id).ok()?;
        let mut data = Vec::new();
        stream.reader.read_to_end(&mut data).ok()?;
        Some(format!("{:016x}", xxh3_64(&data)))
    }
}

/// State shared between the engine handle and the master thread.
struct EngineInner {
    fs: Arc<Fs>,
    api: Arc<dyn DriveApi>,
    vfs: Arc<dyn Vfs>,
    db: Arc<SyncDb>,
    errors: ErrorSink,
    blacklist: Arc<TmpBlacklist>,
    local_root: PathBuf,
    local_observer: LocalObserver,
    remote_observer: RemoteObserver,
    executor: Executor,
    probe: ReplicaProbe,
    options: EngineOptions,
    state: AtomicU8,
    clock: Mutex<Box<dyn Fn() -> SyncTime + Send>>,
}

impl EngineInner {
    fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SyncState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn observers_ready(&self) -> bool {
        self.local_observer.is_ready() && self.remote_observer.is_ready()
    }

    fn run_one_pass(&self) -> SyncResult<PassSummary> {
        if !self.observers_ready() {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::InvalidSnapshot));
        }

        self.set_state(SyncState::Running);

        let local_snapshot = self.local_observer.snapshot().freeze()?;
        let remote_snapshot = self.remote_observer.snapshot().freeze()?;

        let local_ops = compute_operations(ReplicaSide::Local, &local_snapshot, &self.db)?;
        let remote_ops = compute_operations(ReplicaSide::Remote, &remote_snapshot, &self.db)?;

        if local_ops.is_empty() && remote_ops.is_empty() {
            self.set_state(SyncState::Idle);
            return Ok(PassSummary::default());
        }

        let mut local_tree = build_update_tree(&local_ops, &local_snapshot, &self.db)?;
        let mut remote_tree = build_update_tree(&remote_ops, &remote_snapshot, &self.db)?;

        check_platform_inconsistencies(&mut remote_tree, &self.blacklist, &self.errors);

        let conflicts = find_conflicts(&local_tree, &remote_tree);
        let conflict_count = conflicts.len();
        let now = (self.clock.lock().unwrap())();
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local_tree,
            &mut remote_tree,
            &self.probe,
            &self.errors,
            now,
        );

        let ops = generate_operations(&local_tree, &remote_tree, &self.blacklist);
        let plan = sort_operations(ops);

        let pass = self
            .executor
            .run_plan(&plan, &local_snapshot, &remote_snapshot)?;

        let summary = PassSummary {
            planned: plan.len(),
            completed: pass.completed,
            skipped: pass.skipped,
            conflicts: conflict_count,
            restart: pass.restart || resolution.restart_needed(),
        };

        log::info!(
            "Pass done: {} planned, {} completed, {} skipped, {} conflicts{}",
            summary.planned,
            summary.completed,
            summary.skipped,
            summary.conflicts,
            if summary.restart { ", restart" } else { "" }
        );

        self.set_state(SyncState::Idle);
        Ok(summary)
    }

    fn master_loop(&self, shutdown: Receiver<()>) {
        log::trace!("Master thread started");

        loop {
            select! {
                recv(shutdown) -> _ => {
                    log::trace!("Master shutdown signal received");
                    self.set_state(SyncState::Stopped);
                    return;
                },
                default(self.options.loop_interval) => {},
            }

            if matches!(self.state(), SyncState::Paused | SyncState::Error) {
                continue;
            }

            if self.local_observer.has_failed() || self.remote_observer.has_failed() {
                self.set_state(SyncState::Error);
                continue;
            }
            if !self.observers_ready() {
                continue;
            }

            // Let a burst of local activity settle before freezing.
            if self.local_observer.idle_for() < self.options.quiescence {
                continue;
            }

            match self.run_one_pass() {
                Ok(summary) => {
                    if summary.restart {
                        log::debug!("Restart requested; running another pass");
                        continue;
                    }
                }
                Err(exit) if exit.code() == ExitCode::NetworkError => {
                    log::warn!(
                        "Network failure; backing off {:?}",
                        self.options.network_backoff
                    );
                    std::thread::sleep(self.options.network_backoff);
                }
                Err(exit) if exit.cause() == ExitCause::InvalidSnapshot => {
                    // An observer invalidated mid-pass; it will rebuild.
                }
                Err(exit) => {
                    log::error!("Pass failed, pausing sync: {}", exit);
                    report(&self.errors, SyncError::sync(exit));
                    self.set_state(if exit.code() == ExitCode::InvalidToken {
                        SyncState::Paused
                    } else {
                        SyncState::Error
                    });
                }
            }
        }
    }
}

pub struct SyncEngine {
    inner: Arc<EngineInner>,
    shutdown: Option<Sender<()>>,
    master: Option<jod_thread::JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(params: EngineParams) -> SyncResult<Self> {
        let blacklist = Arc::new(TmpBlacklist::new());

        // Leftover upload-session tokens from an interrupted run must be
        // cancelled on the server before anything uploads again.
        cancel_stale_sessions(&params.db, params.api.as_ref());

        let local_observer = LocalObserver::start(
            Arc::clone(&params.fs),
            params.local_root.clone(),
            params.local_root_id.clone(),
            Arc::clone(&params.exclusions),
            Arc::clone(&blacklist),
            Arc::clone(&params.errors),
            params.fault_receiver,
        );

        let remote_observer = RemoteObserver::start(
            Arc::clone(&params.api),
            Arc::clone(&params.db),
            params.remote_root_id.clone(),
            Arc::clone(&blacklist),
            Arc::clone(&params.errors),
            params.options.remote_poll,
        );

        let executor = Executor::new(
            Arc::clone(&params.fs),
            Arc::clone(&params.api),
            Arc::clone(&params.vfs),
            Arc::clone(&params.db),
            Arc::clone(&params.manager),
            Arc::clone(&blacklist),
            Arc::clone(&params.errors),
            params.local_root.clone(),
            params.remote_root_id.clone(),
            local_observer.snapshot().clone(),
            remote_observer.snapshot().clone(),
        );

        let probe = ReplicaProbe {
            fs: Arc::clone(&params.fs),
            api: Arc::clone(&params.api),
            local_root: params.local_root.clone(),
        };

        let inner = Arc::new(EngineInner {
            fs: params.fs,
            api: params.api,
            vfs: params.vfs,
            db: params.db,
            errors: params.errors,
            blacklist,
            local_root: params.local_root,
            local_observer,
            remote_observer,
            executor,
            probe,
            options: params.options,
            state: AtomicU8::new(SyncState::Starting as u8),
            clock: Mutex::new(Box::new(now_epoch)),
        });

        Ok(Self {
            inner,
            shutdown: None,
            master: None,
        })
    }

    pub fn state(&self) -> SyncState {
        self.inner.state()
    }

    /// Override the conflict-timestamp clock (tests pin it for stable
    /// conflict names).
    pub fn set_clock(&self, clock: Box<dyn Fn() -> SyncTime + Send>) {
        *self.inner.clock.lock().unwrap() = clock;
    }

    pub fn pause(&self) {
        self.inner.set_state(SyncState::Paused);
    }

    pub fn resume(&self) {
        if matches!(self.state(), SyncState::Paused | SyncState::Error) {
            self.inner.set_state(SyncState::Idle);
        }
    }

    /// Both observers hold a valid snapshot.
    pub fn observers_ready(&self) -> bool {
        self.inner.observers_ready()
    }

    /// Wait (bounded) for both observers to become ready.
    pub fn wait_for_observers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.inner.local_observer.has_failed() || self.inner.remote_observer.has_failed() {
                return false;
            }
            if self.observers_ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    /// Wait until the local observer has been quiet for the configured
    /// quiescence window.
    pub fn wait_for_quiescence(&self) {
        while self.inner.local_observer.idle_for() < self.inner.options.quiescence {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Run one full pipeline pass. Public so embedders and tests can step
    /// the engine deterministically; the master loop uses the same path.
    pub fn run_one_pass(&self) -> SyncResult<PassSummary> {
        self.inner.run_one_pass()
    }

    /// Run passes until the replicas converge (no planned operations) or
    /// `max_passes` is reached. Returns the number of passes that did
    /// work.
    pub fn sync_until_converged(&self, max_passes: usize) -> SyncResult<usize> {
        for pass_index in 0..max_passes {
            let summary = self.run_one_pass()?;
            if summary.planned == 0 && !summary.restart {
                return Ok(pass_index);
            }
        }
        Ok(max_passes)
    }

    /// Spawn the master loop. Idempotent.
    pub fn start(&mut self) {
        if self.master.is_some() {
            return;
        }

        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
        self.shutdown = Some(shutdown_sender);

        let inner = Arc::clone(&self.inner);
        let handle = jod_thread::Builder::new()
            .name("keel-master".to_owned())
            .spawn(move || inner.master_loop(shutdown_receiver))
            .expect("Could not start master thread");
        self.master = Some(handle);
    }

    /// Stop the master loop and the observers. Jobs already running drain
    /// through the manager.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.master.take() {
            drop(handle);
        }
        self.inner.local_observer.stop();
        self.inner.remote_observer.stop();
        self.inner.set_state(SyncState::Stopped);
    }

    /// Tear the sync pair down for good: stop everything, then strip
    /// virtual-file state from the sync root so the user is left with a
    /// plain directory. Returns the dehydrated placeholders that were
    /// removed.
    pub fn dismantle(mut self) -> SyncResult<Vec<PathBuf>> {
        self.stop();
        VirtualFilesCleaner::new(self.inner.vfs.as_ref(), &self.inner.fs)
            .clean_root(&self.inner.local_root)
    }

    pub fn blacklist(&self) -> &TmpBlacklist {
        &self.inner.blacklist
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.inner.fs
    }

    pub fn db(&self) -> &Arc<SyncDb> {
        &self.inner.db
    }

    pub fn api(&self) -> &Arc<dyn DriveApi> {
        &self.inner.api
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_epoch() -> SyncTime {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as SyncTime)
        .unwrap_or(0)
}

/// Cancel every upload-session token left in the DB by a previous run.
fn cancel_stale_sessions(db: &SyncDb, api: &dyn DriveApi) {
    let tokens = match db.upload_session_tokens() {
        Ok(tokens) => tokens,
        Err(exit) => {
            log::warn!("Could not list stale upload sessions: {}", exit);
            return;
        }
    };

    for (db_id, token) in tokens {
        log::info!("Cancelling stale upload session {}", token);
        if let Err(exit) = api.cancel_upload_session(&token) {
            log::warn!("Stale session cancel failed for {}: {}", token, exit);
        }
        if let Err(exit) = db.delete_upload_session_token(db_id) {
            log::warn!("Could not drop stale session token: {}", exit);
        }
    }
}
